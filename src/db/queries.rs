pub const ALERTS_CHANNEL: &str = "sos_alerts";

pub const CREATE_ALERTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sos_alerts (
    subject_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    contact_email TEXT NOT NULL,
    active BOOLEAN NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('active', 'ended')),
    lat DOUBLE PRECISION,
    lng DOUBLE PRECISION,
    session_id UUID,
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_update_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

pub const CREATE_ACTIVE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS sos_alerts_active_idx ON sos_alerts (active) WHERE active;
"#;

pub const CREATE_PROFILES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    subject_id TEXT PRIMARY KEY,
    full_name TEXT,
    email TEXT
);
"#;

pub const CREATE_NOTIFY_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION sos_alerts_notify() RETURNS trigger AS $$
BEGIN
    PERFORM pg_notify('sos_alerts', NEW.subject_id);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;
"#;

pub const DROP_NOTIFY_TRIGGER: &str = r#"
DROP TRIGGER IF EXISTS sos_alerts_changed ON sos_alerts;
"#;

pub const CREATE_NOTIFY_TRIGGER: &str = r#"
CREATE TRIGGER sos_alerts_changed
AFTER INSERT OR UPDATE ON sos_alerts
FOR EACH ROW EXECUTE FUNCTION sos_alerts_notify();
"#;

pub const SCHEMA: &[&str] = &[
    CREATE_ALERTS_TABLE,
    CREATE_ACTIVE_INDEX,
    CREATE_PROFILES_TABLE,
    CREATE_NOTIFY_FUNCTION,
    DROP_NOTIFY_TRIGGER,
    CREATE_NOTIFY_TRIGGER,
];

// A new activation resets the session fields but keeps the key.
pub const UPSERT_ALERT: &str = r#"
INSERT INTO sos_alerts (subject_id, display_name, contact_email, active, status, lat, lng, session_id, started_at, last_update_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
ON CONFLICT (subject_id) DO UPDATE
SET display_name = $2,
    contact_email = $3,
    active = $4,
    status = $5,
    lat = $6,
    lng = $7,
    session_id = $8,
    started_at = NOW(),
    last_update_at = NOW();
"#;

pub const UPDATE_ALERT_LOCATION: &str = r#"
UPDATE sos_alerts
SET lat = $2,
    lng = $3,
    last_update_at = NOW()
WHERE subject_id = $1;
"#;

pub const END_ALERT: &str = r#"
UPDATE sos_alerts
SET active = false,
    status = 'ended',
    last_update_at = NOW()
WHERE subject_id = $1;
"#;

pub const SELECT_ACTIVE_ALERT_DOCUMENTS: &str = r#"
SELECT jsonb_strip_nulls(jsonb_build_object(
    'subjectId', subject_id,
    'displayName', display_name,
    'contactEmail', contact_email,
    'active', active,
    'status', status,
    'location', CASE WHEN lat IS NULL OR lng IS NULL THEN NULL
                     ELSE jsonb_build_object('lat', lat, 'lng', lng) END,
    'sessionId', session_id,
    'startedAt', to_char(started_at AT TIME ZONE 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS.US"Z"'),
    'lastUpdateTimestamp', to_char(last_update_at AT TIME ZONE 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS.US"Z"')
)) AS doc
FROM sos_alerts
WHERE active = true
ORDER BY started_at ASC;
"#;

pub const SELECT_PROFILE_BY_ID: &str = r#"
SELECT subject_id, full_name, email FROM profiles WHERE subject_id = $1;
"#;

pub const SELECT_PROFILE_BY_EMAIL: &str = r#"
SELECT subject_id, full_name, email FROM profiles WHERE lower(email) = lower($1) LIMIT 1;
"#;
