mod actions;
mod bulk;
mod config;
mod db;
mod draft;
mod executor;
mod gate;
mod ipc;
mod matrix;
mod session;
mod source;
mod telemetry;

use std::io::{self, BufRead, Write};
use tracing::{info, warn};

fn main() {
    telemetry::init_tracing();

    let mut state = ipc::AppState::new(config::AssignmentSettings::from_env());
    info!(target: "assignmentd", version = env!("CARGO_PKG_VERSION"), "sidecar started");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "assignmentd", error = %e, "stdin read failed; exiting");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();

        ipc::pump(&mut state);
    }
}
