//! Schema installation and incremental migrations.
//!
//! The full DDL ships inside the binary. A fresh database is installed by
//! running every migration in order; an existing database reports how many
//! steps it is behind and is only upgraded when the operator allows it.

use tracing::info;

use super::Gateway;
use crate::error::{Error, Result};

/// One migration step, applied in list order inside its own transaction
struct Migration {
    /// Recorded in `timetable.migrations.version`
    version: &'static str,
    sql: &'static str,
}

/// What [`Gateway::schema_state`] found on the configuration database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaState {
    /// No `timetable` schema; installation is implied
    Fresh,
    /// Schema present with this many migrations still to apply
    Pending(usize),
    /// Schema matches this build
    UpToDate,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "00001 Initial schema",
        sql: INITIAL_SCHEMA,
    },
    Migration {
        version: "00064 Capture task output in execution_log",
        sql: "ALTER TABLE timetable.execution_log ADD COLUMN output TEXT",
    },
    Migration {
        version: "00112 Add delete_job()",
        sql: DELETE_JOB_SQL,
    },
];

impl Gateway {
    /// Compare the database against the bundled migration list
    pub async fn schema_state(&self) -> Result<SchemaState> {
        if !self.schema_exists().await? {
            return Ok(SchemaState::Fresh);
        }
        let applied = self.applied_migrations().await?;
        match applied {
            n if n == MIGRATIONS.len() => Ok(SchemaState::UpToDate),
            n if n < MIGRATIONS.len() => Ok(SchemaState::Pending(MIGRATIONS.len() - n)),
            _ => Err(Error::Invariant(
                "database schema is newer than this build".into(),
            )),
        }
    }

    /// Apply every pending migration, oldest first.
    ///
    /// Each step runs in its own transaction together with its bookkeeping
    /// row, so an interrupted upgrade resumes at the failed step.
    pub async fn migrate(&self) -> Result<usize> {
        let applied = if self.schema_exists().await? {
            self.applied_migrations().await?
        } else {
            0
        };
        let pending = &MIGRATIONS[applied.min(MIGRATIONS.len())..];
        for (offset, migration) in pending.iter().enumerate() {
            let mut tx = self.pool().begin().await?;
            sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO timetable.migrations (id, version) VALUES ($1, $2)")
                .bind((applied + offset) as i64)
                .bind(migration.version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(version = migration.version, "Schema migration applied");
        }
        Ok(pending.len())
    }

    async fn schema_exists(&self) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM information_schema.schemata \
             WHERE schema_name = 'timetable')",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }

    async fn applied_migrations(&self) -> Result<usize> {
        let count = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM timetable.migrations")
            .fetch_one(self.pool())
            .await?;
        Ok(count.max(0) as usize)
    }
}

const INITIAL_SCHEMA: &str = r#"
CREATE SCHEMA timetable;

CREATE TABLE timetable.migrations (
    id         BIGINT PRIMARY KEY,
    version    TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE DOMAIN timetable.cron AS TEXT CHECK (
    substr(VALUE, 1, 6) IN ('@every', '@after') AND (substr(VALUE, 7) :: INTERVAL) IS NOT NULL
    OR VALUE = '@reboot'
    OR VALUE ~ '^((\*|\d+)(-\d+)?(/\d+)?(,(\*|\d+)(-\d+)?(/\d+)?)* +){4}((\*|\d+)(-\d+)?(/\d+)?(,(\*|\d+)(-\d+)?(/\d+)?)* ?)$'
);
COMMENT ON DOMAIN timetable.cron IS 'Five-field cron expression or @every/@after/@reboot macro';

CREATE TYPE timetable.command_kind AS ENUM ('SQL', 'PROGRAM', 'BUILTIN');

CREATE TABLE timetable.chain (
    chain_id            BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    chain_name          TEXT NOT NULL UNIQUE,
    run_at              timetable.cron,
    max_instances       INTEGER CHECK (max_instances > 0),
    timeout_ms          BIGINT NOT NULL DEFAULT 0,
    live                BOOLEAN NOT NULL DEFAULT FALSE,
    self_destruct       BOOLEAN NOT NULL DEFAULT FALSE,
    exclusive_execution BOOLEAN NOT NULL DEFAULT FALSE,
    client_name         TEXT,
    on_error            TEXT CHECK (on_error IN ('continue', 'stop', 'ignore'))
);
COMMENT ON TABLE timetable.chain IS 'Scheduled sequence of tasks';
COMMENT ON COLUMN timetable.chain.run_at IS 'NULL means runs on every poll';
COMMENT ON COLUMN timetable.chain.client_name IS 'NULL means any scheduler may run it';

CREATE TABLE timetable.task (
    task_id             BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    chain_id            BIGINT NOT NULL REFERENCES timetable.chain (chain_id)
                        ON UPDATE CASCADE ON DELETE CASCADE,
    task_order          DOUBLE PRECISION NOT NULL,
    task_name           TEXT,
    kind                timetable.command_kind NOT NULL DEFAULT 'SQL',
    command             TEXT NOT NULL,
    run_as              TEXT,
    database_connection TEXT,
    ignore_error        BOOLEAN NOT NULL DEFAULT FALSE,
    autonomous          BOOLEAN NOT NULL DEFAULT FALSE,
    timeout_ms          BIGINT NOT NULL DEFAULT 0
);
COMMENT ON TABLE timetable.task IS 'Executable step of a chain';

CREATE TABLE timetable.parameter (
    task_id  BIGINT NOT NULL REFERENCES timetable.task (task_id)
             ON UPDATE CASCADE ON DELETE CASCADE,
    order_id INTEGER NOT NULL CHECK (order_id > 0),
    value    JSONB,
    PRIMARY KEY (task_id, order_id)
);
COMMENT ON TABLE timetable.parameter IS 'Positional JSON arguments of a task';

CREATE TABLE timetable.run_status (
    run_status_id    BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    chain_id         BIGINT NOT NULL REFERENCES timetable.chain (chain_id)
                     ON UPDATE CASCADE ON DELETE CASCADE,
    execution_status TEXT NOT NULL DEFAULT 'STARTED' CHECK (execution_status IN
        ('STARTED', 'TASK_STARTED', 'TASK_DONE', 'CHAIN_DONE', 'CHAIN_FAILED', 'DEAD')),
    client_name      TEXT NOT NULL,
    started_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_update      TIMESTAMPTZ NOT NULL DEFAULT now()
);
COMMENT ON TABLE timetable.run_status IS 'One row per chain run, states strictly forward';
CREATE INDEX run_status_sweep_idx ON timetable.run_status (client_name, execution_status);

CREATE UNLOGGED TABLE timetable.active_chain (
    run_status_id BIGINT PRIMARY KEY REFERENCES timetable.run_status (run_status_id)
                  ON DELETE CASCADE,
    chain_id      BIGINT NOT NULL,
    client_name   TEXT NOT NULL,
    started_at    TIMESTAMPTZ NOT NULL DEFAULT now()
);
COMMENT ON TABLE timetable.active_chain IS 'Currently running chain instances';
CREATE INDEX active_chain_chain_idx ON timetable.active_chain (chain_id);

CREATE TYPE timetable.log_severity AS ENUM ('DEBUG', 'INFO', 'ERROR', 'USER', 'PANIC');

CREATE TABLE timetable.log (
    ts           TIMESTAMPTZ NOT NULL DEFAULT now(),
    pid          INTEGER NOT NULL,
    client_name  TEXT NOT NULL,
    log_level    timetable.log_severity NOT NULL,
    message      TEXT,
    message_data JSONB
);
COMMENT ON TABLE timetable.log IS 'Scheduler log records shipped by the database sink';

CREATE TABLE timetable.execution_log (
    chain_id    BIGINT,
    task_id     BIGINT,
    task_name   TEXT,
    kind        TEXT,
    command     TEXT,
    started_at  TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ NOT NULL,
    duration_us BIGINT,
    return_code INTEGER,
    client_name TEXT NOT NULL
);
COMMENT ON TABLE timetable.execution_log IS 'History of every task execution';
CREATE INDEX execution_log_chain_idx ON timetable.execution_log (chain_id, started_at);

CREATE FUNCTION timetable.cron_element_to_array(element TEXT, element_type TEXT)
RETURNS INTEGER[] AS $$
DECLARE
    min_val INTEGER;
    max_val INTEGER;
    lo      INTEGER;
    hi      INTEGER;
    step    INTEGER;
    item    TEXT;
    m       TEXT[];
    res     INTEGER[] := '{}';
BEGIN
    SELECT CASE element_type
               WHEN 'minute' THEN 0 WHEN 'hour' THEN 0 WHEN 'day' THEN 1
               WHEN 'month' THEN 1 WHEN 'dow' THEN 0 END,
           CASE element_type
               WHEN 'minute' THEN 59 WHEN 'hour' THEN 23 WHEN 'day' THEN 31
               WHEN 'month' THEN 12 WHEN 'dow' THEN 7 END
      INTO min_val, max_val;
    IF min_val IS NULL THEN
        RAISE EXCEPTION 'unknown cron element type: %', element_type;
    END IF;
    IF element = '*' THEN
        RETURN NULL; -- wildcard
    END IF;
    FOREACH item IN ARRAY string_to_array(element, ',') LOOP
        m := regexp_match(item, '^\*(?:/(\d+))?$');
        IF m IS NOT NULL THEN
            lo := min_val;
            hi := max_val;
            step := COALESCE(m[1]::INTEGER, 1);
        ELSE
            m := regexp_match(item, '^(\d+)(?:-(\d+))?(?:/(\d+))?$');
            IF m IS NULL THEN
                RAISE EXCEPTION 'invalid cron element: %', item;
            END IF;
            lo := m[1]::INTEGER;
            step := COALESCE(m[3]::INTEGER, 1);
            IF m[2] IS NOT NULL THEN
                hi := m[2]::INTEGER;
            ELSIF m[3] IS NOT NULL THEN
                hi := max_val; -- a bare value with a step extends to the field maximum
            ELSE
                hi := lo;
            END IF;
        END IF;
        IF step < 1 THEN
            RAISE EXCEPTION 'invalid cron step: %', item;
        END IF;
        IF lo < min_val OR hi > max_val OR lo > hi THEN
            RAISE EXCEPTION 'cron element out of range: %', item;
        END IF;
        WHILE lo <= hi LOOP
            res := res || lo;
            lo := lo + step;
        END LOOP;
    END LOOP;
    IF element_type = 'dow' THEN
        -- Sunday may be written as 0 or 7
        res := ARRAY(SELECT DISTINCT CASE WHEN v = 7 THEN 0 ELSE v END FROM unnest(res) AS v);
    END IF;
    RETURN res;
END;
$$ LANGUAGE PLPGSQL IMMUTABLE STRICT;

CREATE FUNCTION timetable.is_cron_in_time(run_at timetable.cron, ts TIMESTAMPTZ)
RETURNS BOOLEAN AS $$
BEGIN
    IF run_at IS NULL THEN
        RETURN TRUE;
    END IF;
    RETURN
        COALESCE(timetable.cron_element_to_array(split_part(run_at, ' ', 1), 'minute')
            @> ARRAY[date_part('minute', ts)::INTEGER], TRUE)
    AND COALESCE(timetable.cron_element_to_array(split_part(run_at, ' ', 2), 'hour')
            @> ARRAY[date_part('hour', ts)::INTEGER], TRUE)
    AND COALESCE(timetable.cron_element_to_array(split_part(run_at, ' ', 3), 'day')
            @> ARRAY[date_part('day', ts)::INTEGER], TRUE)
    AND COALESCE(timetable.cron_element_to_array(split_part(run_at, ' ', 4), 'month')
            @> ARRAY[date_part('month', ts)::INTEGER], TRUE)
    AND COALESCE(timetable.cron_element_to_array(split_part(run_at, ' ', 5), 'dow')
            @> ARRAY[date_part('dow', ts)::INTEGER], TRUE);
END;
$$ LANGUAGE PLPGSQL STABLE;

CREATE FUNCTION timetable.get_running_jobs(BIGINT)
RETURNS SETOF timetable.active_chain AS $$
    SELECT * FROM timetable.active_chain WHERE chain_id = $1 ORDER BY started_at
$$ LANGUAGE SQL STRICT;

CREATE FUNCTION timetable.try_start_chain(
    chain_id_in      BIGINT,
    max_instances_in INTEGER,
    client_name_in   TEXT
) RETURNS BIGINT AS $$
DECLARE
    run_id BIGINT;
BEGIN
    -- serializes admission per chain for the duration of this transaction
    PERFORM pg_advisory_xact_lock(chain_id_in);
    IF (SELECT count(*) FROM timetable.active_chain WHERE chain_id = chain_id_in)
       >= max_instances_in THEN
        RETURN NULL;
    END IF;
    INSERT INTO timetable.run_status (chain_id, execution_status, client_name)
    VALUES (chain_id_in, 'STARTED', client_name_in)
    RETURNING run_status_id INTO run_id;
    INSERT INTO timetable.active_chain (run_status_id, chain_id, client_name)
    VALUES (run_id, chain_id_in, client_name_in);
    RETURN run_id;
END;
$$ LANGUAGE PLPGSQL;

CREATE FUNCTION timetable.try_lock_client_name(worker_pid BIGINT, worker_name TEXT)
RETURNS BOOLEAN AS $$
BEGIN
    RAISE DEBUG 'session % (pid %) tries to lock client name %',
        pg_backend_pid(), worker_pid, worker_name;
    RETURN pg_try_advisory_lock('timetable.chain'::regclass::oid::INTEGER,
                                hashtext(worker_name));
END;
$$ LANGUAGE PLPGSQL;
"#;

const DELETE_JOB_SQL: &str = r#"
CREATE FUNCTION timetable.delete_job(job_name TEXT)
RETURNS BOOLEAN AS $$
    WITH del AS (DELETE FROM timetable.chain WHERE chain_name = $1 RETURNING chain_id)
    SELECT EXISTS (SELECT 1 FROM del)
$$ LANGUAGE SQL STRICT;
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_migration_versions_unique() {
        let mut seen = HashSet::new();
        for m in MIGRATIONS {
            assert!(seen.insert(m.version), "duplicate version {}", m.version);
            assert!(!m.sql.trim().is_empty());
        }
    }

    #[test]
    fn test_initial_schema_creates_contract_objects() {
        for object in [
            "CREATE SCHEMA timetable",
            "timetable.chain",
            "timetable.task",
            "timetable.parameter",
            "timetable.run_status",
            "timetable.active_chain",
            "timetable.execution_log",
            "timetable.is_cron_in_time",
            "timetable.get_running_jobs",
            "timetable.try_start_chain",
            "timetable.try_lock_client_name",
        ] {
            assert!(INITIAL_SCHEMA.contains(object), "missing {object}");
        }
    }
}
