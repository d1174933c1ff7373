//! REPL – the operator shell of a running bridge.
//!
//! Supported slash-commands:
//!   /help                      – show this list
//!   /channels                  – configured channels, in insertion order
//!   /status                    – per-channel health and counters
//!   /add <channel json>        – add a channel
//!   /remove <key>              – remove a channel
//!   /get <section>.<key>       – read a setting
//!   /set <section>.<key> <v>   – change a setting
//!   /content <key> <json>      – change what a periodic channel emits
//!   /call <key> <json>         – make a service call
//!   /save                      – write the live configuration back to disk
//!   /quit | /exit              – stop the bridge and exit

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use colored::Colorize;
use serde_json::Value as Json;
use tokio::runtime::Runtime;
use zros_middleware::Bridge;
use zros_types::{ChannelConfig, HealthStatus, Value};

use crate::config;

/// How often the prompt loop looks at the shutdown flag.
const POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Channels,
    Status,
    Add(Box<ChannelConfig>),
    Remove(String),
    Get { section: String, key: String },
    Set { section: String, key: String, value: Json },
    Content { key: String, value: Json },
    Call { key: String, request: Json },
    Save,
    Quit,
}

/// Parse one input line.  The error is the message shown to the operator.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };
    let command = match name {
        "/help" => Command::Help,
        "/channels" => Command::Channels,
        "/status" => Command::Status,
        "/save" => Command::Save,
        "/quit" | "/exit" => Command::Quit,
        "/add" => {
            let channel: ChannelConfig =
                serde_json::from_str(rest).map_err(|e| format!("invalid channel JSON: {e}"))?;
            Command::Add(Box::new(channel))
        }
        "/remove" => Command::Remove(one_word(rest, "/remove <key>")?),
        "/get" => {
            let (section, key) = setting_path(rest, "/get <section>.<key>")?;
            Command::Get { section, key }
        }
        "/set" => {
            let (path, raw) = rest
                .split_once(char::is_whitespace)
                .ok_or("usage: /set <section>.<key> <value>")?;
            let (section, key) = setting_path(path, "/set <section>.<key> <value>")?;
            Command::Set { section, key, value: loose_json(raw.trim()) }
        }
        "/content" => {
            let (key, raw) = key_and_json(rest, "/content <key> <json>")?;
            Command::Content { key, value: raw }
        }
        "/call" => {
            let (key, raw) = key_and_json(rest, "/call <key> <json>")?;
            Command::Call { key, request: raw }
        }
        other => return Err(format!("Unknown command: '{other}'. Type /help for available commands.")),
    };
    Ok(command)
}

fn one_word(rest: &str, usage: &str) -> Result<String, String> {
    match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
        [word] => Ok((*word).to_string()),
        _ => Err(format!("usage: {usage}")),
    }
}

fn setting_path(raw: &str, usage: &str) -> Result<(String, String), String> {
    match raw.trim().split_once('.') {
        Some((section, key)) if !section.is_empty() && !key.is_empty() => Ok((section.to_string(), key.to_string())),
        _ => Err(format!("usage: {usage}")),
    }
}

fn key_and_json(rest: &str, usage: &str) -> Result<(String, Json), String> {
    let (key, raw) = rest.split_once(char::is_whitespace).ok_or_else(|| format!("usage: {usage}"))?;
    let value = serde_json::from_str(raw.trim()).map_err(|e| format!("invalid JSON: {e}"))?;
    Ok((key.to_string(), value))
}

/// JSON when it parses, otherwise the text as a string.
fn loose_json(raw: &str) -> Json {
    serde_json::from_str(raw).unwrap_or_else(|_| Json::String(raw.to_string()))
}

/// Run the shell until `/quit`, end of input, or `shutdown` is set.
pub fn run(rt: &Runtime, bridge: &Bridge, config_path: &Path, shutdown: Arc<AtomicBool>) {
    let lines = spawn_reader();
    let mut prompted = false;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if !prompted {
            print!("{} ", "zros>".bold().cyan());
            io::stdout().flush().ok();
            prompted = true;
        }
        let line = match lines.recv_timeout(POLL) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        prompted = false;
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(command) => execute(rt, bridge, config_path, command),
            Err(e) => println!("{}", e.red()),
        }
    }
}

/// Stdin is read on its own thread so the prompt loop can notice Ctrl-C.
fn spawn_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("{}: {}", "Read error".red(), e);
                    break;
                }
            }
        }
    });
    rx
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn execute(rt: &Runtime, bridge: &Bridge, config_path: &Path, command: Command) {
    match command {
        Command::Help => cmd_help(),
        Command::Channels => cmd_channels(bridge),
        Command::Status => cmd_status(bridge),
        Command::Add(channel) => {
            let key = channel.key.clone();
            report(rt.block_on(bridge.add_channel(*channel)), &format!("Channel {key} added"));
        }
        Command::Remove(key) => {
            if rt.block_on(bridge.remove_channel(&key)) {
                println!("{} {}", "✓ Removed".green(), key.bold());
            } else {
                println!("{} '{}'", "No such channel:".yellow(), key);
            }
        }
        Command::Get { section, key } => match bridge.get_value(&section, &key) {
            Ok(value) => println!("  {section}.{key} = {}", value.to_string().yellow()),
            Err(e) => println!("{}", e.to_string().red()),
        },
        Command::Set { section, key, value } => {
            report(bridge.set_value(&section, &key, value), &format!("{section}.{key} updated"));
        }
        Command::Content { key, value } => {
            report(rt.block_on(bridge.update_content(&key, value)), &format!("Content of {key} updated"));
        }
        Command::Call { key, request } => match rt.block_on(bridge.call_service(&key, Value::from(request), None)) {
            Ok(reply) => println!("  {}", reply.to_json().to_string().green()),
            Err(e) => println!("{}", e.to_string().red()),
        },
        Command::Save => match config::save_to(&bridge.export(), config_path) {
            Ok(()) => println!("{} {}", "✓ Configuration saved to".green(), config_path.display().to_string().bold()),
            Err(e) => println!("{}: {}", "Error saving config".red(), e),
        },
        Command::Quit => {}
    }
}

fn report<E: std::fmt::Display>(result: Result<(), E>, done: &str) {
    match result {
        Ok(()) => println!("{} {}", "✓".green().bold(), done),
        Err(e) => println!("{}", e.to_string().red()),
    }
}

fn cmd_help() {
    println!();
    println!("{}", "zros Commands".bold().underline());
    println!("  {}                      – list configured channels", "/channels".bold().cyan());
    println!("  {}                        – channel health and counters", "/status".bold().cyan());
    println!("  {}          – add a channel", "/add <channel json>".bold().cyan());
    println!("  {}                  – remove a channel", "/remove <key>".bold().cyan());
    println!("  {}         – read a setting", "/get <section>.<key>".bold().cyan());
    println!("  {} – change a setting", "/set <section>.<key> <value>".bold().cyan());
    println!("  {}        – change periodic content", "/content <key> <json>".bold().cyan());
    println!("  {}           – make a service call", "/call <key> <json>".bold().cyan());
    println!("  {}                          – write the configuration to disk", "/save".bold().cyan());
    println!("  {}                   – stop the bridge and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_channels(bridge: &Bridge) {
    let channels = bridge.channels();
    if channels.is_empty() {
        println!("  {}", "No channels configured.".dimmed());
        return;
    }
    println!("{}", "Channels".bold().underline());
    for c in channels {
        let endpoint = c.endpoint.as_deref().unwrap_or("default");
        let remote = c.remote_topic.as_deref().unwrap_or("-");
        let mut line = format!(
            "  {:<16} {:<20} {} ⇄ {} via {} ({})",
            c.key.bold(),
            c.direction.to_string(),
            c.bus_name,
            remote,
            endpoint.dimmed(),
            c.serialization
        );
        if let Some(hz) = c.frequency {
            line.push_str(&format!(" every {:.3}s", 1.0 / hz));
        }
        println!("{line}");
    }
}

fn cmd_status(bridge: &Bridge) {
    let report = bridge.health_report();
    if report.is_empty() {
        println!("  {}", "No channels configured.".dimmed());
        return;
    }
    println!("{}", "Channel Health".bold().underline());
    for h in report {
        let badge = match h.status {
            HealthStatus::Up => "●".green(),
            HealthStatus::Degraded => "●".yellow(),
            HealthStatus::Down => "●".red(),
        };
        let c = &h.counters;
        println!(
            "  {} {:<16} {:<10} {} [{}]",
            badge,
            h.key.bold(),
            h.status.to_string(),
            h.endpoint.dimmed(),
            h.endpoint_state
        );
        println!(
            "      fwd {} · dlv {} · enc-fail {} · dec-fail {} · fallback {} · dropped {} · throttled {} · heartbeats {}",
            c.forwarded, c.delivered, c.encode_failures, c.decode_failures, c.fallbacks, c.dropped, c.throttled, c.heartbeats
        );
        if let (Some(err), Some(at)) = (&h.last_error, h.last_error_at) {
            println!("      {} {} ({})", "last error:".red(), err, at.format("%H:%M:%S"));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use zros_types::Direction;

    use super::*;

    #[test]
    fn bare_commands_parse() {
        assert_eq!(parse_command("/help"), Ok(Command::Help));
        assert_eq!(parse_command("  /status  "), Ok(Command::Status));
        assert_eq!(parse_command("/exit"), Ok(Command::Quit));
        assert_eq!(parse_command("/quit"), Ok(Command::Quit));
    }

    #[test]
    fn unknown_command_is_reported() {
        let err = parse_command("/launch").unwrap_err();
        assert!(err.contains("/launch"));
    }

    #[test]
    fn add_takes_channel_json() {
        let cmd = parse_command(
            r#"/add {"key":"odom","direction":"publish_to_bus","bus_name":"/odom","remote_topic":"odom"}"#,
        )
        .unwrap();
        let Command::Add(channel) = cmd else { panic!("expected /add") };
        assert_eq!(channel.key, "odom");
        assert_eq!(channel.direction, Direction::PublishToBus);
        assert!(parse_command("/add {not json").is_err());
    }

    #[test]
    fn settings_paths_split_on_the_first_dot() {
        assert_eq!(
            parse_command("/get transport.high_water_mark"),
            Ok(Command::Get { section: "transport".into(), key: "high_water_mark".into() })
        );
        assert!(parse_command("/get transport").is_err());
        assert!(parse_command("/get .host").is_err());
    }

    #[test]
    fn set_accepts_json_or_bare_text() {
        assert_eq!(
            parse_command("/set transport.high_water_mark 500"),
            Ok(Command::Set { section: "transport".into(), key: "high_water_mark".into(), value: json!(500) })
        );
        assert_eq!(
            parse_command("/set transport.host robot.local"),
            Ok(Command::Set { section: "transport".into(), key: "host".into(), value: json!("robot.local") })
        );
        assert!(parse_command("/set transport.host").is_err());
    }

    #[test]
    fn call_and_content_need_json() {
        assert_eq!(
            parse_command(r#"/call add {"a": 2, "b": 3}"#),
            Ok(Command::Call { key: "add".into(), request: json!({ "a": 2, "b": 3 }) })
        );
        assert_eq!(
            parse_command(r#"/content heartbeat {"data": "ok"}"#),
            Ok(Command::Content { key: "heartbeat".into(), value: json!({ "data": "ok" }) })
        );
        assert!(parse_command("/call add").is_err());
        assert!(parse_command("/content heartbeat nope").is_err());
    }

    #[test]
    fn remove_takes_exactly_one_key() {
        assert_eq!(parse_command("/remove chatter"), Ok(Command::Remove("chatter".into())));
        assert!(parse_command("/remove").is_err());
        assert!(parse_command("/remove a b").is_err());
    }
}
