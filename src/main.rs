//! Command-line harness for the keep-alive session
//!
//! Stands in for the UI layer: owns the persisted power level, forwards
//! commands to the session controller and prints its state and events as
//! JSON lines. Not part of the engine - everything here could be replaced
//! by a graphical front end without touching the library.

use std::io::{self, BufRead, Write};
use std::thread;

use auxguard::{spawn, SessionConfig, SessionError, SessionState};

const DEFAULT_LEVEL: u8 = 15;

fn main() {
    env_logger::init();

    let (session, events) = match spawn(SessionConfig::default()) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("failed to start session: {}", e);
            std::process::exit(1);
        }
    };

    // Event pump: print controller events as they arrive.
    thread::spawn(move || {
        for event in events {
            match serde_json::to_string(&event) {
                Ok(json) => println!("event {}", json),
                Err(e) => log::warn!("Failed to serialize event: {}", e),
            }
        }
    });

    // The power-level preference lives out here, with the "UI".
    let mut level = DEFAULT_LEVEL;

    println!(
        "auxguard - commands: on, off, level <1-100>, test, ack, simulate, route, devices, status, quit"
    );
    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("stdin error: {}", e);
                break;
            }
        }

        let mut words = line.split_whitespace();
        let result = match words.next() {
            Some("on") => session.activate(level),
            Some("off") => session.deactivate(),
            Some("level") => match words.next().and_then(|w| w.parse::<u8>().ok()) {
                Some(new_level @ 1..=100) => {
                    level = new_level;
                    session.set_level(level)
                }
                _ => {
                    eprintln!("usage: level <1-100>");
                    Ok(())
                }
            },
            Some("test") => session.test_tone(),
            Some("ack") => session.acknowledge_alarm(),
            Some("simulate") => session.trigger_alarm(),
            Some("route") => match session.refresh_route() {
                Ok(label) => {
                    println!("route: {}", label);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Some("devices") => {
                match auxguard::audio::device::list_output_devices() {
                    Ok(devices) => {
                        for device in devices {
                            println!(
                                "  {}{}",
                                device.name,
                                if device.is_default { " (default)" } else { "" }
                            );
                        }
                    }
                    Err(e) => eprintln!("enumeration failed: {}", e),
                }
                Ok(())
            }
            Some("status") => {
                print_status(&session, level);
                Ok(())
            }
            Some("quit") | Some("exit") => break,
            Some(other) => {
                eprintln!("unknown command: {}", other);
                Ok(())
            }
            None => Ok(()),
        };

        match result {
            Ok(()) => {}
            Err(SessionError::Busy) => eprintln!("busy - try again in a moment"),
            Err(e) => eprintln!("error: {}", e),
        }
    }

    let _ = session.shutdown();
}

fn print_status(session: &auxguard::SessionHandle, level: u8) {
    let status = serde_json::json!({
        "state": session.state(),
        "route": session.route_label(),
        "level": level,
    });
    println!("{}", status);

    if session.state() == SessionState::Active {
        if let Ok(Some(bands)) = session.spectrum() {
            let meter: String = bands
                .iter()
                .map(|&m| match (m * 8.0) as u32 {
                    0 => ' ',
                    1 => '.',
                    2 => ':',
                    3 => '-',
                    4 => '=',
                    5 => '+',
                    6 => '*',
                    _ => '#',
                })
                .collect();
            println!("spectrum [{}]", meter);
        }
    }
}
