use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use facemark_core::{
    render::annotate, shared_detector, AttendanceRecord, AttendanceStore, FaceDetector,
    SessionController, SessionReport, SessionRunner, SubjectName,
};
use facemark_hw::{Camera, CameraSource, ImageSequenceSource};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

mod config;
mod render;

use config::Config;
use render::TerminalRenderer;

#[derive(Parser)]
#[command(name = "facemark", about = "Face-presence attendance recorder")]
struct Cli {
    /// Attendance table (overrides FACEMARK_STORE_PATH)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look for a face, then record attendance for today
    Mark {
        /// Your name, as it should appear in the table
        #[arg(short, long)]
        name: String,
        /// V4L2 device to capture from
        #[arg(long)]
        device: Option<String>,
        /// Replay still images from a directory instead of the camera
        #[arg(long)]
        frames_dir: Option<PathBuf>,
        /// Write the latest annotated frame to this PNG
        #[arg(long)]
        preview: Option<PathBuf>,
        /// Consecutive face frames needed to confirm presence
        #[arg(long)]
        confirm_frames: Option<u32>,
    },
    /// List recorded attendance
    List {
        /// Only this day (YYYY-MM-DD)
        #[arg(long, conflicts_with = "today")]
        date: Option<NaiveDate>,
        /// Only today
        #[arg(long)]
        today: bool,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Create the attendance table if it does not exist
    Init,
    /// List video capture devices
    Devices,
    /// Capture one frame and report brightness and faces
    Probe {
        #[arg(long)]
        device: Option<String>,
        /// Write the annotated frame to this PNG
        #[arg(long)]
        preview: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    match cli.command {
        Commands::Mark {
            name,
            device,
            frames_dir,
            preview,
            confirm_frames,
        } => {
            if let Some(device) = device {
                config.camera_device = device;
            }
            if let Some(n) = confirm_frames {
                config.confirm_frames = n;
            }
            mark(config, name, frames_dir, preview).await
        }
        Commands::List { date, today, json } => {
            let date = if today {
                Some(chrono::Local::now().date_naive())
            } else {
                date
            };
            list(&config, date, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init => {
            let store = AttendanceStore::new(&config.store_path);
            if store.ensure_initialized()? {
                println!("Created {}", store.path().display());
            } else {
                println!("{} already exists", store.path().display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Probe { device, preview } => {
            if let Some(device) = device {
                config.camera_device = device;
            }
            probe(&config, preview)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// How long a stopped session may take to wind down before it is abandoned.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Run one session on a dedicated thread; Ctrl-C raises the stop flag.
async fn mark(
    config: Config,
    name: String,
    frames_dir: Option<PathBuf>,
    preview: Option<PathBuf>,
) -> Result<ExitCode> {
    // Reject a blank name before touching the model or the camera.
    if let Err(e) = SubjectName::parse(&name) {
        eprintln!("[warn] {e}");
        return Ok(ExitCode::from(2));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let (reply_tx, reply_rx) = oneshot::channel();
    let thread_stop = stop.clone();

    std::thread::Builder::new()
        .name("facemark-session".into())
        .spawn(move || {
            let result = run_mark(&config, &name, frames_dir, preview, &thread_stop);
            let _ = reply_tx.send(result);
        })
        .context("failed to spawn session thread")?;

    let report = match await_session(reply_rx, &stop, ctrl_c, STOP_GRACE).await? {
        SessionExit::Finished(report) => report?,
        SessionExit::Abandoned => {
            // The session thread is left blocked; process exit closes the device.
            eprintln!("[error] session did not stop, exiting");
            return Ok(ExitCode::FAILURE);
        }
    };

    if let Some(record) = &report.record {
        println!("{}", describe(record));
    }
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[derive(Debug)]
enum SessionExit<T> {
    Finished(T),
    /// Still running after a second stop request or the grace period.
    Abandoned,
}

/// Resolves on SIGINT. Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Wait for the session reply. The first stop signal raises `stop`; a
/// second one, or `grace` elapsing after the first, gives up on the session.
async fn await_session<T, F, Fut>(
    mut reply: oneshot::Receiver<T>,
    stop: &AtomicBool,
    mut stop_signal: F,
    grace: Duration,
) -> Result<SessionExit<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    tokio::select! {
        result = &mut reply => {
            return Ok(SessionExit::Finished(
                result.context("session thread exited without a result")?,
            ));
        }
        _ = stop_signal() => {}
    }

    tracing::info!("stop requested");
    stop.store(true, Ordering::Relaxed);

    tokio::select! {
        result = &mut reply => Ok(SessionExit::Finished(
            result.context("session thread exited without a result")?,
        )),
        _ = stop_signal() => {
            tracing::warn!("second stop request, abandoning session");
            Ok(SessionExit::Abandoned)
        }
        _ = tokio::time::sleep(grace) => {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "session ignored stop request, abandoning");
            Ok(SessionExit::Abandoned)
        }
    }
}

fn run_mark(
    config: &Config,
    name: &str,
    frames_dir: Option<PathBuf>,
    preview: Option<PathBuf>,
    stop: &AtomicBool,
) -> Result<SessionReport> {
    let detector = shared_detector(&config.detector_model_path())?;
    let controller = SessionController::new(
        AttendanceStore::new(&config.store_path),
        config.confirm_frames,
    );
    let mut runner = SessionRunner::new(&controller, detector, TerminalRenderer::new(preview))
        .with_frame_interval(config.frame_interval());

    let report = match frames_dir {
        Some(dir) => runner.run(name, &mut ImageSequenceSource::new(dir), stop)?,
        None => runner.run(
            name,
            &mut CameraSource::new(config.camera_device.clone(), config.warmup_frames),
            stop,
        )?,
    };
    tracing::info!(
        subject = %report.subject,
        frames = report.frames,
        outcome = %report.message(),
        "session finished"
    );
    Ok(report)
}

fn list(config: &Config, date: Option<NaiveDate>, json: bool) -> Result<()> {
    let store = AttendanceStore::new(&config.store_path);
    let records = match date {
        Some(date) => store.query_by_date(date)?,
        None => store.query_all()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No attendance recorded");
        return Ok(());
    }
    for record in &records {
        println!("{}", describe(record));
    }
    Ok(())
}

fn describe(record: &AttendanceRecord) -> String {
    format!(
        "{:<24} {}  {:<9}  {}",
        record.name,
        record.date_field(),
        record.day_field(),
        record.time_field()
    )
}

/// Camera diagnostics: bypasses the session and store entirely.
fn probe(config: &Config, preview: Option<PathBuf>) -> Result<()> {
    println!("Capturing from {}...", config.camera_device);
    let frame = Camera::open(&config.camera_device)?.capture_frame()?;
    println!(
        "Frame {}x{}  brightness {:.1}{}",
        frame.width,
        frame.height,
        frame.avg_brightness(),
        if frame.is_dark { "  (dark)" } else { "" }
    );

    let faces = match shared_detector(&config.detector_model_path()) {
        Ok(mut detector) => {
            let faces = detector.detect(&frame)?;
            println!("Faces detected: {}", faces.len());
            for face in &faces {
                println!(
                    "  at ({:.0}, {:.0}) {:.0}x{:.0}  confidence {:.2}",
                    face.x, face.y, face.width, face.height, face.confidence
                );
            }
            faces
        }
        Err(e) => {
            println!("Detector unavailable: {e}");
            Vec::new()
        }
    };

    if let Some(path) = preview {
        annotate(&frame, &faces)
            .to_gray_image()?
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::pin::Pin;

    type Signal = Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Stop signal that fires at once for the first `count` calls, then never.
    fn stop_signals(count: usize) -> impl FnMut() -> Signal {
        let mut calls = 0;
        move || {
            calls += 1;
            let fire = calls <= count;
            let signal: Signal = Box::pin(async move {
                if !fire {
                    std::future::pending::<()>().await;
                }
            });
            signal
        }
    }

    #[tokio::test]
    async fn test_session_finishes_without_stop() {
        let (tx, rx) = oneshot::channel();
        tx.send(7).unwrap();
        let stop = AtomicBool::new(false);

        let exit = await_session(rx, &stop, stop_signals(0), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(exit, SessionExit::Finished(7)));
        assert!(!stop.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_stop_flag_ends_cooperative_session() {
        let (tx, rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let session_stop = stop.clone();
        std::thread::spawn(move || {
            while !session_stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(1));
            }
            let _ = tx.send("stopped");
        });

        let exit = await_session(rx, &stop, stop_signals(1), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(exit, SessionExit::Finished("stopped")));
    }

    #[tokio::test]
    async fn test_second_stop_abandons_blocked_session() {
        // sender held open: the session never replies
        let (_tx, rx) = oneshot::channel::<()>();
        let stop = AtomicBool::new(false);

        let exit = await_session(rx, &stop, stop_signals(2), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(exit, SessionExit::Abandoned));
        assert!(stop.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_grace_expiry_abandons_blocked_session() {
        let (_tx, rx) = oneshot::channel::<()>();
        let stop = AtomicBool::new(false);

        let exit = await_session(rx, &stop, stop_signals(1), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(matches!(exit, SessionExit::Abandoned));
        assert!(stop.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_session_thread_dropping_reply_is_error() {
        let (tx, rx) = oneshot::channel::<()>();
        drop(tx);
        let stop = AtomicBool::new(false);
        assert!(await_session(rx, &stop, stop_signals(0), Duration::from_secs(60))
            .await
            .is_err());
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_mark() {
        let cli = Cli::try_parse_from([
            "facemark",
            "--store",
            "/tmp/a.csv",
            "mark",
            "--name",
            "Alice",
            "--frames-dir",
            "/tmp/frames",
        ])
        .unwrap();
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/a.csv")));
        match cli.command {
            Commands::Mark {
                name, frames_dir, ..
            } => {
                assert_eq!(name, "Alice");
                assert_eq!(frames_dir, Some(PathBuf::from("/tmp/frames")));
            }
            _ => panic!("expected mark"),
        }
    }

    #[test]
    fn test_list_date_conflicts_with_today() {
        assert!(Cli::try_parse_from(["facemark", "list", "--date", "2024-05-01", "--today"]).is_err());
        assert!(Cli::try_parse_from(["facemark", "list", "--date", "yesterday"]).is_err());
        let cli = Cli::try_parse_from(["facemark", "list", "--date", "2024-05-01"]).unwrap();
        match cli.command {
            Commands::List { date, .. } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2024, 5, 1));
            }
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn test_describe_row() {
        let at = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let line = describe(&AttendanceRecord::new("Alice", at));
        assert!(line.starts_with("Alice "));
        assert!(line.ends_with("2024-05-01  Wednesday  09:00:00"));
    }
}
