use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::Colorize;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use wakeclock::prelude::*;
use wakeclock::{ENGINE_NAME, VERSION as LIB_VERSION};

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct ShellHighlighter;

impl Highlighter for ShellHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            Cow::Owned(format!("{} {}", command.yellow().bold(), rest.yellow()))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }
    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    const LOGO_TEXT: &str = include_str!("../logo.log");
    println!("{}", LOGO_TEXT.cyan());
    let rule = "-".repeat(72);
    println!("{}", rule.dimmed());
    println!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    let license_blurb = "
    This software is provided 'as is', without warranty of any kind.
    Distributed under the MIT OR Apache-2.0 license. Use at your own risk.
    ";
    println!("{}", license_blurb.dimmed());
    println!("{}", rule.dimmed());
}

/// Prints lifecycle events as they happen, and observer events while `watching` is on.
fn spawn_event_listeners(registry: &AlarmRegistry, watching: Arc<AtomicBool>) {
    let mut lifecycle_rx = registry.subscribe_lifecycle_events();
    tokio::spawn(async move {
        while let Ok(event) = lifecycle_rx.recv().await {
            let kind = format!("{:?}", event.kind).to_uppercase();
            let kind = match event.kind {
                NotifyKind::Alert | NotifyKind::Prealarm => kind.red().bold(),
                NotifyKind::Snooze => kind.blue().bold(),
                NotifyKind::Dismiss | NotifyKind::CancelSnooze => kind.dimmed(),
            };
            println!("\n<-- [ALARM {}] {}", event.alarm_id, kind);
        }
    });

    let mut observer_rx = registry.subscribe_observer_events();
    tokio::spawn(async move {
        while let Ok(event) = observer_rx.recv().await {
            if !watching.load(Ordering::Relaxed) {
                continue;
            }
            match event {
                ObserverEvent::AlarmsChanged(alarms) => {
                    println!("\n<-- [OBSERVER] {} alarm(s)", alarms.len())
                }
                ObserverEvent::NextAlarmChanged(next) => {
                    println!("\n<-- [OBSERVER] next: {:?}", next)
                }
            }
        }
    });
}

fn parse_id(arg: Option<&&str>) -> Result<AlarmId, String> {
    let raw = arg.ok_or("missing alarm id")?;
    raw.trim_start_matches('#')
        .parse::<i64>()
        .map(AlarmId)
        .map_err(|_| format!("'{}' is not an alarm id", raw))
}

fn parse_time(raw: &str) -> Option<(u32, u32)> {
    let (hour, minute) = raw.split_once(':')?;
    Some((hour.parse().ok()?, minute.parse().ok()?))
}

fn local(at: DateTime<Utc>, registry: &AlarmRegistry) -> String {
    at.with_timezone(&registry.config().timezone)
        .format("%a %Y-%m-%d %H:%M")
        .to_string()
}

fn print_alarm(alarm: &Alarm, registry: &AlarmRegistry, verbose: bool) {
    let switch = if alarm.enabled {
        "on ".green().bold()
    } else {
        "off".dimmed()
    };
    println!(
        "  {:<4} {:02}:{:02} {} {:<14} {:<28} {}",
        alarm.id.to_string(),
        alarm.hour,
        alarm.minute,
        switch,
        alarm.state.as_str(),
        alarm.days_of_week.to_string(),
        alarm.label
    );
    if verbose {
        println!("       next     {}", local(alarm.next_time, registry));
        if alarm.is_prealarm {
            println!("       prealarm {}", local(alarm.prealarm_time, registry));
        }
        if alarm.is_snoozed {
            println!("       snoozed  {}", local(alarm.snoozed_time, registry));
        }
        println!(
            "       vibrate {} | alert {}",
            alarm.vibrate,
            alarm.alert_uri.as_deref().unwrap_or("silent")
        );
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  new                     - Creates a disabled alarm at the current time.");
    println!("  list                    - Lists every alarm.");
    println!("  show <ID>               - Shows one alarm in detail.");
    println!("  set <ID> <HH:MM>        - Changes the time of day.");
    println!("  days <ID> <DAYS>        - Sets repeat days: mon,wed,fri | daily | never.");
    println!("  prealarm <ID> on|off    - Toggles the pre-alarm.");
    println!("  label <ID> <TEXT>       - Sets the label.");
    println!("  enable <ID>             - Turns an alarm on.");
    println!("  disable <ID>            - Turns an alarm off.");
    println!("  snooze <ID> [HH:MM]     - Snoozes a ringing alarm.");
    println!("  dismiss <ID>            - Dismisses a ringing or snoozed alarm.");
    println!("  delete <ID>             - Deletes an alarm.");
    println!("  next                    - Shows the next pending wake.");
    println!("  watch on|off            - Prints observer events.");
    println!("  exit                    - Quits the shell.");
}

/// Runs one shell command. `Err` carries a message for the user.
async fn run_command(
    registry: &AlarmRegistry,
    args: &[&str],
    watching: &AtomicBool,
) -> Result<(), String> {
    let Some(&command) = args.first() else {
        return Ok(());
    };
    let failed = |err: WakeclockError| err.to_string();
    let updated = |alarm: Alarm| {
        println!("--> Updated:");
        print_alarm(&alarm, registry, false);
    };

    match command {
        "new" => {
            let id = registry.create_new_alarm().await.map_err(failed)?;
            println!("--> Created alarm {}", id);
        }
        "list" => {
            let alarms = registry.get_alarms_list();
            if alarms.is_empty() {
                println!("No alarms. Use 'new' to create one.");
            }
            for alarm in &alarms {
                print_alarm(alarm, registry, false);
            }
        }
        "show" => {
            let alarm = registry.get_alarm(parse_id(args.get(1))?).map_err(failed)?;
            print_alarm(&alarm, registry, true);
        }
        "set" => {
            let id = parse_id(args.get(1))?;
            let (hour, minute) = args
                .get(2)
                .and_then(|raw| parse_time(raw))
                .ok_or("Usage: set <ID> <HH:MM>")?;
            updated(registry.edit(id, |e| e.at(hour, minute)).await.map_err(failed)?);
        }
        "days" => {
            let id = parse_id(args.get(1))?;
            let days = args
                .get(2)
                .and_then(|raw| DaysOfWeek::parse(raw))
                .ok_or("Usage: days <ID> <mon,tue,...|daily|never>")?;
            updated(registry.edit(id, |e| e.on_days(days)).await.map_err(failed)?);
        }
        "prealarm" => {
            let id = parse_id(args.get(1))?;
            let on = match args.get(2) {
                Some(&"on") => true,
                Some(&"off") => false,
                _ => return Err("Usage: prealarm <ID> on|off".into()),
            };
            updated(registry.edit(id, |e| e.prealarm(on)).await.map_err(failed)?);
        }
        "label" => {
            let id = parse_id(args.get(1))?;
            let text = args.get(2..).unwrap_or_default().join(" ");
            updated(registry.edit(id, |e| e.labelled(text)).await.map_err(failed)?);
        }
        "enable" | "disable" => {
            let id = parse_id(args.get(1))?;
            let alarm = registry
                .enable(id, command == "enable")
                .await
                .map_err(failed)?;
            updated(alarm);
        }
        "snooze" => {
            let id = parse_id(args.get(1))?;
            let alarm = match args.get(2) {
                Some(raw) => {
                    let (hour, minute) =
                        parse_time(raw).ok_or("Usage: snooze <ID> [HH:MM]")?;
                    registry.snooze_until(id, hour, minute).await
                }
                None => registry.snooze(id).await,
            }
            .map_err(failed)?;
            updated(alarm);
        }
        "dismiss" => {
            let id = parse_id(args.get(1))?;
            updated(registry.dismiss(id).await.map_err(failed)?);
        }
        "delete" => {
            let id = parse_id(args.get(1))?;
            registry.delete(id).await.map_err(failed)?;
            println!("--> Deleted alarm {}", id);
        }
        "next" => match registry.next_alarm() {
            Some(next) => println!(
                "--> Next wake: alarm {} at {} ({:?}{})",
                next.alarm_id,
                local(next.at, registry),
                next.kind,
                if next.is_prealarm { ", pre-alarm" } else { "" }
            ),
            None => println!("--> Nothing is armed."),
        },
        "watch" => {
            let on = matches!(args.get(1), Some(&"on"));
            watching.store(on, Ordering::Relaxed);
            println!("--> Observer events {}.", if on { "shown" } else { "hidden" });
        }
        "help" => print_help(),
        _ => return Err(format!("Unknown command: '{}'. Type 'help'.", command)),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_target(false)
        .init();

    let config_path = env::args().nth(1).map(PathBuf::from);
    let config = WakeclockConfig::load(config_path.as_deref())?;
    let store = Arc::new(JsonFileStore::new(config.store_path.clone()));
    let registry = AlarmRegistry::with_system_timer(config, store).await?;

    let watching = Arc::new(AtomicBool::new(false));
    spawn_event_listeners(&registry, watching.clone());
    info!("{} started", ENGINE_NAME);

    let mut rl = Editor::new()?;
    rl.set_helper(Some(ShellHighlighter));

    println!(
        "{} is running with {} alarm(s). Type 'help' for commands or 'exit' to quit.",
        ENGINE_NAME.cyan(),
        registry.get_alarms_list().len()
    );

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        match rl.readline(&prompt) {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.split_whitespace().collect::<Vec<_>>();
                if args.first() == Some(&"exit") {
                    break;
                }
                if let Err(message) = run_command(&registry, &args, &watching).await {
                    println!("{} {}", "Error:".red().bold(), message);
                }
            }
            Err(_) => break,
        }
    }

    println!("Exiting wakeshell...");
    registry.flush().await;
    Ok(())
}
