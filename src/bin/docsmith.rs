use docsmith::config::Settings;
use docsmith::runtime::{
    self, bootstrap_state_root, cleanup_stale_supervisor, default_state_root_path,
    drain_queue_once, load_supervisor_state, run_sweep_once, signal_stop, StatePaths,
};
use docsmith::store::TaskStore;

const USAGE: &str = "usage: docsmith <start|stop|status|drain|sweep>";

fn run() -> Result<(), String> {
    let command = std::env::args().nth(1).unwrap_or_default();
    let state_root = default_state_root_path().map_err(|e| e.to_string())?;
    let paths = StatePaths::new(&state_root);
    bootstrap_state_root(&paths).map_err(|e| e.to_string())?;
    let settings = Settings::load_or_default(&state_root).map_err(|e| e.to_string())?;

    match command.as_str() {
        "start" => {
            cleanup_stale_supervisor(&paths).map_err(|e| e.to_string())?;
            let state = load_supervisor_state(&paths).map_err(|e| e.to_string())?;
            if state.running {
                return Err(format!(
                    "supervisor is already running with pid {}",
                    state.pid.unwrap_or_default()
                ));
            }
            runtime::run_supervisor(&state_root, settings).map_err(|e| e.to_string())
        }
        "stop" => {
            signal_stop(&paths).map_err(|e| e.to_string())?;
            println!("stop requested");
            Ok(())
        }
        "status" => {
            let state = load_supervisor_state(&paths).map_err(|e| e.to_string())?;
            if state.running {
                println!("running pid={}", state.pid.unwrap_or_default());
            } else {
                println!("not running");
            }
            for (worker_id, health) in &state.workers {
                println!(
                    "worker {worker_id}: {:?} last_heartbeat={:?}",
                    health.state, health.last_heartbeat
                );
            }
            Ok(())
        }
        "drain" => {
            let processed =
                drain_queue_once(&state_root, &settings, settings.queue.max_concurrency)?;
            println!("processed {processed} item(s)");
            Ok(())
        }
        "sweep" => {
            let store = TaskStore::open(&state_root).map_err(|e| e.to_string())?;
            let report = run_sweep_once(&state_root, &store)?;
            println!(
                "timed_out={} reclaimed={}",
                report.timed_out, report.reclaimed
            );
            Ok(())
        }
        _ => Err(USAGE.to_string()),
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
