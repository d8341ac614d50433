use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Profile {
    pub subject_id: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
}

impl Profile {
    /// Trimmed full name, `None` when blank.
    pub fn name(&self) -> Option<&str> {
        self.full_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}
