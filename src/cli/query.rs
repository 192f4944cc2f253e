use anyhow::{Context, Result};
use chrono::prelude::*;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use stybulate::{Cell, Headers, Style, Table};

use super::Command;
use crate::client::DaemonClient;
use crate::config::Config;
use crate::engine::{explain_suggestion, Suggestion};
use crate::protocol::{Request, Response, SearchFormat, Status};
use crate::store::{CommandContext, CommandRecord, SequenceStat};

pub fn client_main(config_path: Option<PathBuf>, command: Command) -> Result<()> {
    let config = Config::load(config_path.as_deref())?;
    let client = DaemonClient::new(&config.daemon.socket_path);

    match command {
        Command::Daemon(_) => anyhow::bail!("The daemon is started through server_main"),
        Command::Init => crate::cli::eval::show_bash_eval_string(&config),
        Command::Suggest {
            partial,
            cwd,
            history,
            explain,
        } => {
            let response = checked(client.send(&Request::Suggest {
                partial,
                cwd: Some(cwd.map_or_else(current_dir, Ok)?),
                history,
            })?)?;
            let suggestions: Vec<Suggestion> = field(&response, "suggestions")?;
            for s in suggestions {
                if explain {
                    println!("{}\t{}", s.command, explain_suggestion(&s));
                } else {
                    println!("{}", s.command);
                }
            }
            Ok(())
        }
        Command::Log {
            exit_code,
            duration,
            cwd,
            session,
            command,
        } => {
            let response = client.send(&Request::LogCommand {
                command,
                exit_code,
                duration,
                cwd: cwd.map_or_else(current_dir, Ok)?,
                session_id: session,
            })?;
            if response.status == Status::Filtered {
                tracing::debug!(reason = ?response.reason, "Command not recorded");
                return Ok(());
            }
            checked(response).map(|_| ())
        }
        Command::Search {
            query,
            limit,
            indir,
            full,
            nh,
        } => {
            let format = if full {
                SearchFormat::Dashboard
            } else {
                SearchFormat::Client
            };
            let response = checked(client.send(&Request::Search {
                query,
                limit,
                format,
                cwd: indir,
            })?)?;
            if full {
                let records: Vec<CommandRecord> = field(&response, "results")?;
                print_records(&records, nh);
            } else {
                let commands: Vec<String> = field(&response, "results")?;
                for command in commands {
                    println!("{}", command);
                }
            }
            Ok(())
        }
        Command::Sequences { limit } => {
            let response = checked(client.send(&Request::Sequences { limit })?)?;
            let sequences: Vec<SequenceStat> = field(&response, "sequences")?;
            let rows: Vec<Vec<String>> = sequences
                .iter()
                .map(|s| vec![s.frequency.to_string(), format_time(s.last_used), s.sequence.clone()])
                .collect();
            print_table(&rows, Some(vec!["count", "last", "sequence"]));
            Ok(())
        }
        Command::Context { id, window } => {
            let response = checked(client.send(&Request::Context {
                command_id: id,
                window,
            })?)?;
            let context: CommandContext = field(&response, "context")?;
            let mut records = context.before;
            let target_at = records.len();
            records.push(context.target);
            records.extend(context.after);
            for (i, r) in records.iter().enumerate() {
                let marker = if i == target_at { ">" } else { " " };
                println!("{} {:>6}  {}  {}", marker, r.id, format_time(r.timestamp), r.command);
            }
            Ok(())
        }
        Command::Status => {
            let response = checked(client.send(&Request::Status)?)?;
            let mut rows = Vec::new();
            flatten_status("", &Value::Object(response.body), &mut rows);
            print_table(&rows, None);
            Ok(())
        }
        Command::Stop => stop(&client, &config),
    }
}

fn stop(client: &DaemonClient, config: &Config) -> Result<()> {
    match client.send(&Request::Shutdown) {
        Ok(response) => checked(response).map(|_| ()),
        Err(err) => {
            // socket is gone or wedged; fall back to the PID marker
            let pid_path = &config.daemon.pid_path;
            let pid: i32 = std::fs::read_to_string(pid_path)
                .map_err(|_| err)
                .context("Daemon is not running")?
                .trim()
                .parse()
                .with_context(|| format!("Malformed PID marker {}", pid_path.display()))?;
            kill(Pid::from_raw(pid), Signal::SIGTERM)
                .with_context(|| format!("Unable to signal daemon pid {}", pid))?;
            Ok(())
        }
    }
}

fn current_dir() -> Result<String> {
    Ok(std::env::current_dir()
        .context("Unable to read current directory")?
        .display()
        .to_string())
}

fn checked(response: Response) -> Result<Response> {
    match response.status {
        Status::Error => anyhow::bail!(
            "Daemon error: {}",
            response.error.as_deref().unwrap_or("unknown")
        ),
        _ => Ok(response),
    }
}

fn field<T: DeserializeOwned>(response: &Response, key: &str) -> Result<T> {
    let value = response
        .get(key)
        .with_context(|| format!("Daemon response has no {:?}", key))?;
    serde_json::from_value(value.clone()).with_context(|| format!("Malformed {:?} in response", key))
}

fn format_time(timestamp: f64) -> String {
    let dt = match Utc.timestamp_opt(timestamp as i64, 0).single() {
        Some(dt) => dt,
        None => return String::from("?"),
    };
    let local = DateTime::<Local>::from(dt);
    if local.date_naive() == Local::now().date_naive() {
        local.format("%-I:%M%p").to_string()
    } else {
        local.format("%m/%d").to_string()
    }
}

fn print_records(records: &[CommandRecord], nh: bool) {
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            vec![
                format_time(r.timestamp),
                r.exit_code.to_string(),
                r.cwd.clone(),
                r.command.clone(),
            ]
        })
        .collect();
    let headers = if nh {
        None
    } else {
        Some(vec!["time", "exit", "dir", "cmd"])
    };
    print_table(&rows, headers);
}

fn print_table(rows: &[Vec<String>], headers: Option<Vec<&str>>) {
    let cells: Vec<Vec<Cell>> = rows
        .iter()
        .map(|row| row.iter().map(|s| Cell::from(s.as_str())).collect())
        .collect();
    let result = Table::new(Style::Plain, cells, headers.map(Headers::from)).tabulate();
    println!("{}", result);
}

fn flatten_status(prefix: &str, value: &Value, rows: &mut Vec<Vec<String>>) {
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_status(&name, value, rows);
            }
        }
        Value::String(s) => rows.push(vec![prefix.to_string(), s.clone()]),
        Value::Null => rows.push(vec![prefix.to_string(), "-".to_string()]),
        other => rows.push(vec![prefix.to_string(), other.to_string()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_payload_flattens_to_dotted_rows() {
        let mut rows = Vec::new();
        flatten_status(
            "",
            &json!({"state": "running", "store": {"total_commands": 3}, "resources": null}),
            &mut rows,
        );
        assert!(rows.contains(&vec!["state".to_string(), "running".to_string()]));
        assert!(rows.contains(&vec!["store.total_commands".to_string(), "3".to_string()]));
        assert!(rows.contains(&vec!["resources".to_string(), "-".to_string()]));
    }

    #[test]
    fn error_responses_become_errors() {
        assert!(checked(Response::error("boom")).is_err());
        assert!(checked(Response::filtered("privacy")).is_ok());
    }
}
