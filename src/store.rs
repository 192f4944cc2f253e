//! Durable command history, sessions and usage statistics.
//!
//! One SQLite connection behind a mutex. The daemon handles requests one at a
//! time, so the lock is never contended in practice; it exists so the store
//! can be shared between the daemon and the suggestion engine.

use anyhow::{anyhow, Context, Result};
use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::schema::create_schema;
use crate::util::{epoch_now, SECONDS_PER_DAY};

/// Commands that follow an anchor later than this are unrelated.
pub const FOLLOW_WINDOW_SECS: f64 = 300.0;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub id: i64,
    pub timestamp: f64,
    pub command: String,
    pub cwd: String,
    pub exit_code: i32,
    pub duration: Option<f64>,
    pub session_id: String,
    pub shell: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
}

impl CommandRecord {
    fn from_row(row: &Row) -> rusqlite::Result<CommandRecord> {
        Ok(CommandRecord {
            id: row.get("id")?,
            timestamp: row.get("timestamp")?,
            command: row.get("command")?,
            cwd: row.get("cwd")?,
            exit_code: row.get("exit_code")?,
            duration: row.get("duration")?,
            session_id: row.get("session_id")?,
            shell: row.get("shell")?,
            user: row.get("user")?,
            hostname: row.get("hostname")?,
        })
    }
}

const RECORD_COLUMNS: &str =
    "h.id, h.timestamp, h.command, h.cwd, h.exit_code, h.duration, h.session_id, h.shell, h.user, h.hostname";

/// A command about to be written. Only the first four fields are required.
#[derive(Debug, Clone, Default)]
pub struct NewCommand<'a> {
    pub command: &'a str,
    pub cwd: &'a str,
    pub exit_code: i32,
    pub session_id: &'a str,
    pub duration: Option<f64>,
    pub shell: Option<&'a str>,
    pub user: Option<&'a str>,
    pub hostname: Option<&'a str>,
    /// Defaults to now.
    pub timestamp: Option<f64>,
}

impl<'a> NewCommand<'a> {
    pub fn new(command: &'a str, cwd: &'a str, exit_code: i32, session_id: &'a str) -> Self {
        NewCommand {
            command,
            cwd,
            exit_code,
            session_id,
            ..Default::default()
        }
    }

    pub fn duration(mut self, duration: Option<f64>) -> Self {
        self.duration = duration;
        self
    }

    pub fn at(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub total_commands: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PatternStat {
    pub context: String,
    pub command: String,
    pub frequency: i64,
    pub success_rate: f64,
    pub last_used: f64,
    pub avg_duration: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SequenceStat {
    pub sequence: String,
    pub frequency: i64,
    pub last_used: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreStatistics {
    pub total_commands: i64,
    pub successful_commands: i64,
    pub success_rate: f64,
    pub total_sessions: i64,
    pub db_size_bytes: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandContext {
    pub before: Vec<CommandRecord>,
    pub target: CommandRecord,
    pub after: Vec<CommandRecord>,
}

/// A command text with how often and how recently it was run.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFrequency {
    pub command: String,
    pub frequency: i64,
    pub last_used: f64,
}

/// Aggregate history for one command text, as used by the ranker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandUsage {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub last_used: Option<f64>,
    pub directories: Vec<String>,
    pub total_frequency: i64,
}

impl CommandUsage {
    pub fn success_rate(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.successful as f64 / self.total as f64)
        }
    }
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CommandStore {
    con: Mutex<Connection>,
}

impl CommandStore {
    pub fn open(path: &Path) -> Result<CommandStore> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Creating database directory {}", parent.display()))?;
        }
        let con = Connection::open(path)
            .with_context(|| format!("Opening history database {}", path.display()))?;
        CommandStore::from_connection(con)
    }

    pub fn open_in_memory() -> Result<CommandStore> {
        CommandStore::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(con: Connection) -> Result<CommandStore> {
        con.busy_timeout(BUSY_TIMEOUT)?;
        create_schema(&con)?;
        Ok(CommandStore {
            con: Mutex::new(con),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.con
            .lock()
            .map_err(|_| anyhow!("History database lock was poisoned"))
    }

    pub fn create_session(&self, shell: Option<&str>, cwd: Option<&str>) -> Result<String> {
        let id = rusty_ulid::generate_ulid_string();
        self.lock()?.execute(
            "insert into sessions (id, start_time, shell, cwd) values (?, ?, ?, ?)",
            params![id, epoch_now(), shell, cwd],
        )?;
        info!(session = %id, "Created session");
        Ok(id)
    }

    pub fn end_session(&self, session_id: &str) -> Result<()> {
        let updated = self.lock()?.execute(
            "update sessions set end_time = ? where id = ? and end_time is null",
            params![epoch_now(), session_id],
        )?;
        if updated == 0 {
            debug!(session = %session_id, "Session already closed or unknown");
        }
        Ok(())
    }

    pub fn ensure_session_exists(
        &self,
        session_id: &str,
        shell: Option<&str>,
        cwd: Option<&str>,
    ) -> Result<()> {
        ensure_session(&*self.lock()?, session_id, shell, cwd)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let con = self.lock()?;
        let session = con
            .query_row(
                "select id, start_time, end_time, shell, cwd, total_commands
                 from sessions where id = ?",
                [session_id],
                |row| {
                    Ok(Session {
                        id: row.get(0)?,
                        start_time: row.get(1)?,
                        end_time: row.get(2)?,
                        shell: row.get(3)?,
                        cwd: row.get(4)?,
                        total_commands: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    pub fn insert_command(&self, entry: &NewCommand) -> Result<i64> {
        let con = self.lock()?;
        let tx = con.unchecked_transaction()?;
        ensure_session(&tx, entry.session_id, entry.shell, Some(entry.cwd))?;
        tx.execute(
            "insert into command_history
                (timestamp, command, cwd, exit_code, duration, session_id, shell, user, hostname)
             values (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.timestamp.unwrap_or_else(epoch_now),
                entry.command,
                entry.cwd,
                entry.exit_code,
                entry.duration,
                entry.session_id,
                entry.shell,
                entry.user,
                entry.hostname,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "update sessions set total_commands = total_commands + 1 where id = ?",
            [entry.session_id],
        )?;
        tx.commit().context("Committing command insert")?;
        Ok(id)
    }

    pub fn search(
        &self,
        query: &str,
        limit: usize,
        cwd_filter: Option<&str>,
    ) -> Result<Vec<CommandRecord>> {
        let fts_query = match fts_query(query) {
            Some(q) => q,
            None => return Ok(Vec::new()),
        };
        // component-wise: "/work" covers "/work/x" but not "/workshop"
        let cwd_root = cwd_filter.map(|cwd| cwd.trim_end_matches('/'));

        let con = self.lock()?;
        let mut stmt = con.prepare_cached(&format!(
            "select {RECORD_COLUMNS}
             from command_history_fts f
             join command_history h on h.id = f.rowid
             where command_history_fts match :query
               and (:cwd is null
                    or h.cwd = :cwd
                    or substr(h.cwd, 1, length(:cwd) + 1) = :cwd || '/')
             order by h.timestamp desc, h.id desc
             limit :limit"
        ))?;
        let rows = stmt.query_map(
            named_params! {
                ":query": fts_query,
                ":cwd": cwd_root,
                ":limit": limit as i64,
            },
            CommandRecord::from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_recent_commands(&self, n: usize, successful_only: bool) -> Result<Vec<CommandRecord>> {
        let con = self.lock()?;
        let mut stmt = con.prepare_cached(&format!(
            "select {RECORD_COLUMNS}
             from command_history h
             where (:all or h.exit_code = 0)
             order by h.timestamp desc, h.id desc
             limit :limit"
        ))?;
        let rows = stmt.query_map(
            named_params! { ":all": !successful_only, ":limit": n as i64 },
            CommandRecord::from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_pattern_statistics(
        &self,
        context: &str,
        command: &str,
        success: bool,
        duration: Option<f64>,
    ) -> Result<()> {
        // every right-hand side below reads the pre-update row
        self.lock()?.execute(
            "insert into command_patterns
                (context, command, frequency, success_rate, last_used, avg_duration)
             values (:context, :command, 1, :success, :now, :duration)
             on conflict(context, command) do update set
                success_rate = (success_rate * frequency + excluded.success_rate) / (frequency + 1),
                avg_duration = case
                    when excluded.avg_duration is null then avg_duration
                    when avg_duration is null then excluded.avg_duration
                    else (avg_duration * frequency + excluded.avg_duration) / (frequency + 1)
                end,
                frequency = frequency + 1,
                last_used = excluded.last_used",
            named_params! {
                ":context": context,
                ":command": command,
                ":success": if success { 1.0 } else { 0.0 },
                ":now": epoch_now(),
                ":duration": duration,
            },
        )?;
        Ok(())
    }

    pub fn get_pattern(&self, context: &str, command: &str) -> Result<Option<PatternStat>> {
        let con = self.lock()?;
        let stat = con
            .query_row(
                "select context, command, frequency, success_rate, last_used, avg_duration
                 from command_patterns where context = ? and command = ?",
                [context, command],
                |row| {
                    Ok(PatternStat {
                        context: row.get(0)?,
                        command: row.get(1)?,
                        frequency: row.get(2)?,
                        success_rate: row.get(3)?,
                        last_used: row.get(4)?,
                        avg_duration: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(stat)
    }

    pub fn record_sequence(&self, sequence: &str) -> Result<()> {
        self.lock()?.execute(
            "insert into command_sequences (sequence, frequency, last_used) values (?, 1, ?)
             on conflict(sequence) do update set
                frequency = frequency + 1,
                last_used = excluded.last_used",
            params![sequence, epoch_now()],
        )?;
        Ok(())
    }

    pub fn frequent_sequences(&self, min_frequency: i64, limit: usize) -> Result<Vec<SequenceStat>> {
        let con = self.lock()?;
        let mut stmt = con.prepare_cached(
            "select sequence, frequency, last_used from command_sequences
             where frequency >= ?
             order by frequency desc, last_used desc
             limit ?",
        )?;
        let rows = stmt.query_map(params![min_frequency, limit as i64], |row| {
            Ok(SequenceStat {
                sequence: row.get(0)?,
                frequency: row.get(1)?,
                last_used: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recent successful command in `session_id` other than `exclude_id`.
    pub fn previous_successful(&self, session_id: &str, exclude_id: i64) -> Result<Option<String>> {
        let con = self.lock()?;
        let command = con
            .query_row(
                "select command from command_history
                 where session_id = ? and exit_code = 0 and id != ?
                 order by timestamp desc, id desc
                 limit 1",
                params![session_id, exclude_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(command)
    }

    pub fn get_command_context(&self, command_id: i64, window: usize) -> Result<Option<CommandContext>> {
        let con = self.lock()?;
        let target = con
            .query_row(
                &format!("select {RECORD_COLUMNS} from command_history h where h.id = ?"),
                [command_id],
                CommandRecord::from_row,
            )
            .optional()?;
        let target = match target {
            Some(target) => target,
            None => return Ok(None),
        };

        let neighbours = |sql: &str| -> Result<Vec<CommandRecord>> {
            let mut stmt = con.prepare_cached(sql)?;
            let rows = stmt.query_map(
                params![target.session_id, target.timestamp, target.id, window as i64],
                CommandRecord::from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        };

        let mut before = neighbours(&format!(
            "select {RECORD_COLUMNS} from command_history h
             where h.session_id = ?1
               and (h.timestamp < ?2 or (h.timestamp = ?2 and h.id < ?3))
             order by h.timestamp desc, h.id desc
             limit ?4"
        ))?;
        before.reverse();
        let after = neighbours(&format!(
            "select {RECORD_COLUMNS} from command_history h
             where h.session_id = ?1
               and (h.timestamp > ?2 or (h.timestamp = ?2 and h.id > ?3))
             order by h.timestamp asc, h.id asc
             limit ?4"
        ))?;

        Ok(Some(CommandContext {
            before,
            target,
            after,
        }))
    }

    pub fn cleanup_old_data(&self, retention_days: u32) -> Result<usize> {
        let cutoff = epoch_now() - retention_days as f64 * SECONDS_PER_DAY;
        let con = self.lock()?;
        let tx = con.unchecked_transaction()?;
        let deleted = tx.execute("delete from command_history where timestamp < ?", [cutoff])?;
        let patterns = tx.execute("delete from command_patterns where last_used < ?", [cutoff])?;
        let sequences = tx.execute("delete from command_sequences where last_used < ?", [cutoff])?;
        tx.commit()?;
        info!(
            deleted,
            patterns, sequences, retention_days, "Pruned history past retention"
        );
        Ok(deleted)
    }

    pub fn get_statistics(&self) -> Result<StoreStatistics> {
        let con = self.lock()?;
        let stats = con.query_row(
            "select
                (select count(*) from command_history),
                (select count(*) from command_history where exit_code = 0),
                (select count(*) from sessions),
                (select page_count * page_size from pragma_page_count(), pragma_page_size())",
            [],
            |row| {
                let total: i64 = row.get(0)?;
                let successful: i64 = row.get(1)?;
                Ok(StoreStatistics {
                    total_commands: total,
                    successful_commands: successful,
                    success_rate: if total > 0 {
                        successful as f64 / total as f64
                    } else {
                        0.0
                    },
                    total_sessions: row.get(2)?,
                    db_size_bytes: row.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Successful commands starting with `prefix` (case-sensitive), most
    /// frequent first, ties broken by recency.
    pub fn prefix_matches(
        &self,
        prefix: &str,
        cwd: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommandFrequency>> {
        let con = self.lock()?;
        // the range keeps the scan on hist_command; substr is the exact test
        let mut stmt = con.prepare_cached(
            "select command, count(*) as frequency, max(timestamp) as last_used
             from command_history
             where command >= :prefix
               and command < :prefix || char(1114111)
               and substr(command, 1, length(:prefix)) = :prefix
               and exit_code = 0
               and (:cwd is null or cwd = :cwd)
             group by command
             order by frequency desc, last_used desc
             limit :limit",
        )?;
        let rows = stmt.query_map(
            named_params! {
                ":prefix": prefix,
                ":cwd": cwd,
                ":limit": limit as i64,
            },
            command_frequency,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Successful commands run within [`FOLLOW_WINDOW_SECS`] after `anchor`
    /// in the same session.
    pub fn following_commands(
        &self,
        anchor: &str,
        prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommandFrequency>> {
        let con = self.lock()?;
        let mut stmt = con.prepare_cached(
            "select next.command, count(*) as frequency, max(next.timestamp) as last_used
             from command_history prev
             join command_history next
               on next.session_id = prev.session_id
              and next.timestamp > prev.timestamp
              and next.timestamp - prev.timestamp <= :window
             where prev.command = :anchor
               and next.exit_code = 0
               and (:prefix is null or substr(next.command, 1, length(:prefix)) = :prefix)
             group by next.command
             order by frequency desc, last_used desc
             limit :limit",
        )?;
        let rows = stmt.query_map(
            named_params! {
                ":anchor": anchor,
                ":window": FOLLOW_WINDOW_SECS,
                ":prefix": prefix,
                ":limit": limit as i64,
            },
            command_frequency,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn command_usage(&self, command: &str) -> Result<CommandUsage> {
        let con = self.lock()?;
        let (total, successful, last_used) = con.query_row(
            "select count(*), coalesce(sum(exit_code = 0), 0), max(timestamp)
             from command_history where command = ?",
            [command],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get(2)?)),
        )?;
        let mut stmt =
            con.prepare_cached("select distinct cwd from command_history where command = ?")?;
        let directories = stmt
            .query_map([command], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        let total_frequency: i64 = con.query_row(
            "select coalesce(sum(frequency), 0) from command_patterns where command = ?",
            [command],
            |row| row.get(0),
        )?;

        Ok(CommandUsage {
            total,
            successful,
            failed: total - successful,
            last_used,
            directories,
            total_frequency,
        })
    }
}

fn ensure_session(
    con: &Connection,
    session_id: &str,
    shell: Option<&str>,
    cwd: Option<&str>,
) -> Result<()> {
    let created = con.execute(
        "insert or ignore into sessions (id, start_time, shell, cwd) values (?, ?, ?, ?)",
        params![session_id, epoch_now(), shell, cwd],
    )?;
    if created > 0 {
        debug!(session = %session_id, "Registered unseen session");
    }
    Ok(())
}

fn command_frequency(row: &Row) -> rusqlite::Result<CommandFrequency> {
    Ok(CommandFrequency {
        command: row.get(0)?,
        frequency: row.get(1)?,
        last_used: row.get(2)?,
    })
}

/// Turn free text into an FTS5 query: every whitespace-separated token
/// becomes a quoted prefix term, all of which must match.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|token| format!("\"{}\"*", token.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_session() -> (CommandStore, String) {
        let store = CommandStore::open_in_memory().unwrap();
        let session = store.create_session(Some("bash"), Some("/home/me")).unwrap();
        (store, session)
    }

    #[test]
    fn ensure_session_is_idempotent() {
        let store = CommandStore::open_in_memory().unwrap();
        store.ensure_session_exists("tty-7", Some("zsh"), Some("/")).unwrap();
        store.ensure_session_exists("tty-7", Some("bash"), Some("/tmp")).unwrap();

        assert_eq!(store.get_statistics().unwrap().total_sessions, 1);
        let session = store.get_session("tty-7").unwrap().unwrap();
        assert_eq!(session.shell.as_deref(), Some("zsh"));
    }

    #[test]
    fn insert_creates_unknown_session_and_counts() {
        let store = CommandStore::open_in_memory().unwrap();
        store
            .insert_command(&NewCommand::new("ls", "/tmp", 0, "fresh"))
            .unwrap();
        store
            .insert_command(&NewCommand::new("pwd", "/tmp", 0, "fresh"))
            .unwrap();

        let session = store.get_session("fresh").unwrap().unwrap();
        assert_eq!(session.total_commands, 2);
        assert!(session.end_time.is_none());
    }

    #[test]
    fn end_session_sets_end_time_once() {
        let (store, session) = store_with_session();
        store.end_session(&session).unwrap();
        let first = store.get_session(&session).unwrap().unwrap().end_time;
        assert!(first.is_some());
        store.end_session(&session).unwrap();
        assert_eq!(store.get_session(&session).unwrap().unwrap().end_time, first);
    }

    #[test]
    fn search_finds_inserted_command() {
        let (store, session) = store_with_session();
        let id = store
            .insert_command(&NewCommand::new("docker compose up -d", "/srv/app", 0, &session))
            .unwrap();
        store
            .insert_command(&NewCommand::new("ls -la", "/srv/app", 0, &session))
            .unwrap();

        let hits = store.search("docker compose up -d", 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert_eq!(hits[0].command, "docker compose up -d");

        // cwd is indexed as well
        assert_eq!(store.search("/srv/app", 10, None).unwrap().len(), 2);
        assert!(store.search("   ", 10, None).unwrap().is_empty());
    }

    #[test]
    fn search_orders_newest_first_and_filters_cwd() {
        let (store, session) = store_with_session();
        store
            .insert_command(&NewCommand::new("make test", "/a", 0, &session).at(100.0))
            .unwrap();
        store
            .insert_command(&NewCommand::new("make build", "/b/c", 0, &session).at(200.0))
            .unwrap();

        let hits = store.search("make", 10, None).unwrap();
        let commands: Vec<_> = hits.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["make build", "make test"]);

        let hits = store.search("make", 10, Some("/b")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].cwd, "/b/c");
    }

    #[test]
    fn search_cwd_filter_is_case_sensitive_and_component_wise() {
        let (store, session) = store_with_session();
        for (i, cwd) in ["/work", "/work/x", "/Work/x", "/workshop"].iter().enumerate() {
            store
                .insert_command(&NewCommand::new("cargo test", cwd, 0, &session).at(i as f64 + 1.0))
                .unwrap();
        }

        let cwds: Vec<String> = store
            .search("cargo", 10, Some("/work"))
            .unwrap()
            .into_iter()
            .map(|r| r.cwd)
            .collect();
        assert_eq!(cwds, vec!["/work/x", "/work"]);

        let trailing = store.search("cargo", 10, Some("/work/")).unwrap();
        assert_eq!(trailing.len(), 2);
        assert_eq!(store.search("cargo", 10, Some("/")).unwrap().len(), 4);
        assert!(store.search("cargo", 10, Some("/wor")).unwrap().is_empty());
    }

    #[test]
    fn search_tolerates_quotes() {
        let (store, session) = store_with_session();
        store
            .insert_command(&NewCommand::new("echo \"hi there\"", "/", 0, &session))
            .unwrap();
        assert_eq!(store.search("echo \"hi", 10, None).unwrap().len(), 1);
    }

    #[test]
    fn recent_commands_respect_success_filter() {
        let (store, session) = store_with_session();
        store
            .insert_command(&NewCommand::new("true", "/", 0, &session).at(1.0))
            .unwrap();
        store
            .insert_command(&NewCommand::new("false", "/", 1, &session).at(2.0))
            .unwrap();

        let all = store.get_recent_commands(10, false).unwrap();
        assert_eq!(all[0].command, "false");
        assert_eq!(all.len(), 2);
        let ok = store.get_recent_commands(10, true).unwrap();
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].command, "true");
    }

    #[test]
    fn pattern_success_rate_tracks_observed_ratio() {
        let store = CommandStore::open_in_memory().unwrap();
        let outcomes = [true, false, true, true, false, true, true];
        for ok in outcomes {
            store
                .update_pattern_statistics("/repo", "cargo test", ok, Some(2.0))
                .unwrap();
        }

        let stat = store.get_pattern("/repo", "cargo test").unwrap().unwrap();
        let expected = outcomes.iter().filter(|ok| **ok).count() as f64 / outcomes.len() as f64;
        assert_eq!(stat.frequency, outcomes.len() as i64);
        assert!((stat.success_rate - expected).abs() < 1e-9);
        assert!((stat.avg_duration.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn pattern_first_sight_inserts_frequency_one() {
        let store = CommandStore::open_in_memory().unwrap();
        store
            .update_pattern_statistics("/", "make", false, None)
            .unwrap();
        let stat = store.get_pattern("/", "make").unwrap().unwrap();
        assert_eq!(stat.frequency, 1);
        assert_eq!(stat.success_rate, 0.0);
        assert_eq!(stat.avg_duration, None);
    }

    #[test]
    fn command_context_stays_in_session() {
        let (store, session) = store_with_session();
        let other = store.create_session(None, None).unwrap();
        let mut ids = Vec::new();
        for (i, cmd) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            ids.push(
                store
                    .insert_command(&NewCommand::new(cmd, "/", 0, &session).at(i as f64 * 10.0))
                    .unwrap(),
            );
        }
        store
            .insert_command(&NewCommand::new("noise", "/", 0, &other).at(15.0))
            .unwrap();

        let ctx = store.get_command_context(ids[2], 1).unwrap().unwrap();
        assert_eq!(ctx.target.command, "c");
        assert_eq!(ctx.before.iter().map(|r| r.command.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(ctx.after.iter().map(|r| r.command.as_str()).collect::<Vec<_>>(), vec!["d"]);

        let ctx = store.get_command_context(ids[2], 10).unwrap().unwrap();
        assert_eq!(
            ctx.before.iter().map(|r| r.command.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(ctx.after.len(), 2);

        assert!(store.get_command_context(9_999, 3).unwrap().is_none());
    }

    #[test]
    fn cleanup_drops_only_old_rows() {
        let (store, session) = store_with_session();
        let old = epoch_now() - 40.0 * SECONDS_PER_DAY;
        store
            .insert_command(&NewCommand::new("ancient", "/", 0, &session).at(old))
            .unwrap();
        store
            .insert_command(&NewCommand::new("recent", "/", 0, &session))
            .unwrap();

        assert_eq!(store.cleanup_old_data(30).unwrap(), 1);
        let left = store.get_recent_commands(10, false).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].command, "recent");
        assert!(store.search("ancient", 10, None).unwrap().is_empty());
    }

    #[test]
    fn cleanup_prunes_stale_patterns_and_sequences() {
        let (store, _) = store_with_session();
        store.update_pattern_statistics("/", "stale", true, None).unwrap();
        store.update_pattern_statistics("/", "fresh", true, None).unwrap();
        store.record_sequence("a && stale").unwrap();
        store.record_sequence("a && fresh").unwrap();

        let old = epoch_now() - 40.0 * SECONDS_PER_DAY;
        {
            let con = store.lock().unwrap();
            con.execute(
                "update command_patterns set last_used = ? where command = 'stale'",
                [old],
            )
            .unwrap();
            con.execute(
                "update command_sequences set last_used = ? where sequence = 'a && stale'",
                [old],
            )
            .unwrap();
        }

        // no history rows were old, so nothing is counted
        assert_eq!(store.cleanup_old_data(30).unwrap(), 0);
        assert!(store.get_pattern("/", "stale").unwrap().is_none());
        assert!(store.get_pattern("/", "fresh").unwrap().is_some());
        let sequences: Vec<String> = store
            .frequent_sequences(1, 10)
            .unwrap()
            .into_iter()
            .map(|s| s.sequence)
            .collect();
        assert_eq!(sequences, vec!["a && fresh"]);
    }

    #[test]
    fn statistics_aggregate_history() {
        let (store, session) = store_with_session();
        store
            .insert_command(&NewCommand::new("ok", "/", 0, &session))
            .unwrap();
        store
            .insert_command(&NewCommand::new("bad", "/", 2, &session))
            .unwrap();

        let stats = store.get_statistics().unwrap();
        assert_eq!(stats.total_commands, 2);
        assert_eq!(stats.successful_commands, 1);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.total_sessions, 1);
        assert!(stats.db_size_bytes > 0);
    }

    #[test]
    fn prefix_matches_are_case_sensitive_and_literal() {
        let (store, session) = store_with_session();
        for cmd in ["git status", "git status", "Git stash", "git_stuff", "git stash"] {
            store
                .insert_command(&NewCommand::new(cmd, "/r", 0, &session))
                .unwrap();
        }
        store
            .insert_command(&NewCommand::new("git stage", "/r", 1, &session))
            .unwrap();

        let hits = store.prefix_matches("git st", None, 10).unwrap();
        let commands: Vec<_> = hits.iter().map(|h| h.command.as_str()).collect();
        assert_eq!(commands, vec!["git status", "git stash"]);
        assert_eq!(hits[0].frequency, 2);

        assert!(store.prefix_matches("git st", Some("/elsewhere"), 10).unwrap().is_empty());

        // prefixes with multi-byte characters stay inside the range bound
        for cmd in ["echo café au lait", "echo cafés", "echo cafe"] {
            store
                .insert_command(&NewCommand::new(cmd, "/r", 0, &session))
                .unwrap();
        }
        let mut cafe: Vec<_> = store
            .prefix_matches("echo café", None, 10)
            .unwrap()
            .into_iter()
            .map(|h| h.command)
            .collect();
        cafe.sort();
        assert_eq!(cafe, vec!["echo café au lait", "echo cafés"]);
    }

    #[test]
    fn following_commands_respect_window_and_session() {
        let (store, session) = store_with_session();
        let other = store.create_session(None, None).unwrap();
        let seq = [
            ("git add .", 0.0, 0),
            ("git commit", 10.0, 0),
            ("git add .", 1_000.0, 0),
            ("git commit", 1_020.0, 0),
            ("git push", 1_030.0, 0),
            ("git add .", 5_000.0, 0),
            ("git push", 5_400.0, 0),
            ("git add .", 6_000.0, 0),
            ("git commit", 6_005.0, 1),
        ];
        for (cmd, ts, code) in seq {
            store
                .insert_command(&NewCommand::new(cmd, "/r", code, &session).at(ts))
                .unwrap();
        }
        store
            .insert_command(&NewCommand::new("git add .", "/r", 0, &other).at(0.0))
            .unwrap();
        store
            .insert_command(&NewCommand::new("rm -rf build", "/r", 0, &other).at(5.0))
            .unwrap();

        let hits = store.following_commands("git add .", None, 10).unwrap();
        let by_cmd: Vec<_> = hits.iter().map(|h| (h.command.as_str(), h.frequency)).collect();
        assert_eq!(by_cmd[0], ("git commit", 2));
        assert!(by_cmd.contains(&("git push", 1)));
        assert!(by_cmd.contains(&("rm -rf build", 1)));

        let hits = store.following_commands("git add .", Some("git p"), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].command, "git push");
    }

    #[test]
    fn usage_aggregates_per_command() {
        let (store, session) = store_with_session();
        store
            .insert_command(&NewCommand::new("make", "/a", 0, &session).at(10.0))
            .unwrap();
        store
            .insert_command(&NewCommand::new("make", "/b", 2, &session).at(20.0))
            .unwrap();
        store.update_pattern_statistics("/a", "make", true, None).unwrap();
        store.update_pattern_statistics("/c", "make", true, None).unwrap();

        let usage = store.command_usage("make").unwrap();
        assert_eq!(usage.total, 2);
        assert_eq!(usage.successful, 1);
        assert_eq!(usage.failed, 1);
        assert_eq!(usage.last_used, Some(20.0));
        assert_eq!(usage.total_frequency, 2);
        let mut dirs = usage.directories.clone();
        dirs.sort();
        assert_eq!(dirs, vec!["/a".to_string(), "/b".to_string()]);

        let none = store.command_usage("never-run").unwrap();
        assert_eq!(none.total, 0);
        assert_eq!(none.last_used, None);
        assert_eq!(none.success_rate(), None);
    }

    #[test]
    fn sequences_count_repeats() {
        let store = CommandStore::open_in_memory().unwrap();
        store.record_sequence("git add . && git commit").unwrap();
        store.record_sequence("git add . && git commit").unwrap();
        store.record_sequence("ls && cd ..").unwrap();

        let top = store.frequent_sequences(2, 10).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].sequence, "git add . && git commit");
        assert_eq!(top[0].frequency, 2);
    }

    #[test]
    fn previous_successful_skips_failures_and_self() {
        let (store, session) = store_with_session();
        store
            .insert_command(&NewCommand::new("cd repo", "/", 0, &session).at(1.0))
            .unwrap();
        store
            .insert_command(&NewCommand::new("make", "/", 2, &session).at(2.0))
            .unwrap();
        let id = store
            .insert_command(&NewCommand::new("make clean", "/", 0, &session).at(3.0))
            .unwrap();

        assert_eq!(
            store.previous_successful(&session, id).unwrap().as_deref(),
            Some("cd repo")
        );
    }

    #[test]
    fn fts_query_quotes_tokens() {
        assert_eq!(fts_query("git  st").as_deref(), Some("\"git\"* \"st\"*"));
        assert_eq!(fts_query("a\"b").as_deref(), Some("\"a\"\"b\"*"));
        assert_eq!(fts_query(" \t"), None);
    }
}
