use anyhow::{Context, Result};
use rusqlite::Connection;

pub const SCHEMA_VERSION: i32 = 1;

pub fn create_schema(con: &Connection) -> Result<()> {
    con.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = normal;
        PRAGMA foreign_keys = ON;

        create table if not exists sessions (
            id text primary key,
            start_time real not null,
            end_time real,
            shell text,
            cwd text,
            total_commands integer not null default 0
        );
        create table if not exists command_history (
            id integer primary key autoincrement,
            timestamp real not null,
            command text not null,
            cwd text not null,
            exit_code int not null,
            duration real,
            session_id text not null references sessions (id),
            shell text,
            user text,
            hostname text
        );
        create table if not exists command_patterns (
            id integer primary key autoincrement,
            context text not null,
            command text not null,
            frequency int not null default 1,
            success_rate real not null default 0.0,
            last_used real not null,
            avg_duration real,
            unique(context, command)
        );
        create table if not exists command_sequences (
            id integer primary key autoincrement,
            sequence text not null unique,
            frequency int not null default 1,
            last_used real not null
        );

        create virtual table if not exists command_history_fts using fts5(
            command,
            cwd,
            content = 'command_history',
            content_rowid = 'id',
            tokenize = \"unicode61 tokenchars '-_./'\"
        );
        create trigger if not exists command_history_ai after insert on command_history begin
            insert into command_history_fts (rowid, command, cwd)
                values (new.id, new.command, new.cwd);
        end;
        create trigger if not exists command_history_ad after delete on command_history begin
            insert into command_history_fts (command_history_fts, rowid, command, cwd)
                values ('delete', old.id, old.command, old.cwd);
        end;
        create trigger if not exists command_history_au after update on command_history begin
            insert into command_history_fts (command_history_fts, rowid, command, cwd)
                values ('delete', old.id, old.command, old.cwd);
            insert into command_history_fts (rowid, command, cwd)
                values (new.id, new.command, new.cwd);
        end;

        create index if not exists hist_time on command_history(timestamp);
        create index if not exists hist_command on command_history(command);
        create index if not exists hist_session on command_history(session_id);
        create index if not exists hist_exit_code on command_history(exit_code);
        create index if not exists hist_cwd on command_history(cwd);
        create index if not exists pattern_command on command_patterns(command);
",
    )
    .context("Creating history schema")?;

    con.pragma_update(None, "user_version", SCHEMA_VERSION)
        .context("Recording schema version")?;

    Ok(())
}
