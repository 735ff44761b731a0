use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use segflow_core::checksum::{file_digest, ChecksumRequest, ChecksumType};
use segflow_core::{
    CoreError, DownloadEngine, DownloadJob, DownloadOutcome, EngineConfig, ProgressCallback,
    ProgressEvent, SegmentSpec,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let result = match args[1].as_str() {
        "fetch" => run_fetch(&args[2..]),
        "digest" => run_digest(&args[2..]),
        "config" => print_config(),
        _ => {
            print_usage();
            return;
        }
    };
    if let Err(err) = result {
        eprintln!("error: {}", err);
        process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

struct FetchArgs {
    list: PathBuf,
    dest: PathBuf,
    config: EngineConfig,
    checksum: Option<ChecksumRequest>,
}

fn parse_fetch_args(args: &[String]) -> Result<FetchArgs, CoreError> {
    let mut positional = Vec::new();
    let mut config = EngineConfig::default();
    let mut checksum = None;
    let mut idx = 0;
    while idx < args.len() {
        let arg = args[idx].as_str();
        if !arg.starts_with("--") {
            positional.push(arg.to_string());
            idx += 1;
            continue;
        }
        let value = args
            .get(idx + 1)
            .ok_or_else(|| CoreError::InvalidInput(format!("{} needs a value", arg)))?;
        match arg {
            "--config" => {
                let text = fs::read_to_string(value)?;
                config = serde_json::from_str(&text)
                    .map_err(|err| CoreError::InvalidInput(format!("{}: {}", value, err)))?;
            }
            "--workers" => config.workers = parse_number(arg, value)?,
            "--attempts" => config.max_attempts = parse_number(arg, value)?,
            "--delay-ms" => config.base_delay_ms = parse_number(arg, value)?,
            "--limit" => config.speed_limit_bytes_per_sec = Some(parse_number(arg, value)?),
            "--compact-at" => config.compaction_threshold_bytes = Some(parse_number(arg, value)?),
            "--temp-dir" => config.temp_dir = Some(PathBuf::from(value)),
            "--proxy" => config.proxy = Some(value.to_string()),
            "--checksum" => checksum = Some(ChecksumRequest::parse(value)?),
            "--fail-fast" => {
                config.suppress_transient_errors = !matches!(value.as_str(), "true" | "1" | "yes")
            }
            _ => return Err(CoreError::InvalidInput(format!("unknown option {}", arg))),
        }
        idx += 2;
    }

    if positional.len() != 2 {
        return Err(CoreError::InvalidInput(
            "fetch needs <list> and <dest>".to_string(),
        ));
    }
    let dest = PathBuf::from(positional.pop().unwrap_or_default());
    let list = PathBuf::from(positional.pop().unwrap_or_default());
    Ok(FetchArgs {
        list,
        dest,
        config,
        checksum,
    })
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, CoreError> {
    value
        .parse()
        .map_err(|_| CoreError::InvalidInput(format!("{} expects a number, got '{}'", flag, value)))
}

/// Reads a segment list: either a JSON array of segment objects or one
/// `uri [size]` per line, with `#` comments.
fn read_segment_list(path: &Path) -> Result<Vec<SegmentSpec>, CoreError> {
    let text = fs::read_to_string(path)?;
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(&text)
            .map_err(|err| CoreError::InvalidInput(format!("{}: {}", path.display(), err)));
    }
    let mut specs = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let uri = parts.next().unwrap_or_default();
        let mut spec = SegmentSpec::new(uri);
        if let Some(size) = parts.next() {
            let size = size.parse().map_err(|_| {
                CoreError::InvalidInput(format!("line {}: bad size '{}'", line_no + 1, size))
            })?;
            spec = spec.with_expected_size(size);
        }
        specs.push(spec);
    }
    Ok(specs)
}

fn run_fetch(args: &[String]) -> Result<(), CoreError> {
    let args = parse_fetch_args(args)?;
    let segments = read_segment_list(&args.list)?;
    debug!(list = %args.list.display(), segments = segments.len(), "segment list loaded");
    let mut job = DownloadJob::new(segments, &args.dest);
    if let Some(checksum) = args.checksum {
        job = job.with_checksum(checksum);
    }

    let engine = DownloadEngine::new(args.config)?.with_progress(progress_printer(&args.dest));
    match engine.download(job)? {
        DownloadOutcome::Completed(report) => {
            let secs = report.elapsed.as_secs_f64();
            let speed = if secs > 0.0 {
                (report.bytes as f64 / secs) as u64
            } else {
                0
            };
            println!(
                "done: {} in {} ({}/s), {} segments, {} workers, {} retries, {} compactions",
                format_bytes(report.bytes),
                format_duration(report.elapsed.as_secs()),
                format_bytes(speed),
                report.segments,
                report.workers,
                report.retries,
                report.compactions,
            );
        }
        DownloadOutcome::Canceled => println!("canceled"),
    }
    Ok(())
}

fn run_digest(args: &[String]) -> Result<(), CoreError> {
    let (Some(path), Some(kind)) = (args.first(), args.get(1)) else {
        print_usage();
        return Ok(());
    };
    let checksum_type = ChecksumType::parse(kind)
        .ok_or_else(|| CoreError::InvalidInput(format!("unknown checksum type '{}'", kind)))?;
    let digest = file_digest(Path::new(path), checksum_type)?;
    println!("{}:{}", checksum_type.as_str(), digest);
    Ok(())
}

fn print_config() -> Result<(), CoreError> {
    let text = serde_json::to_string_pretty(&EngineConfig::default())
        .map_err(|err| CoreError::InvalidInput(err.to_string()))?;
    println!("{}", text);
    Ok(())
}

fn print_usage() {
    eprintln!(
        "Usage: segflow <command> [args]\n\
Commands:\n\
  fetch <list> <dest> [options]   Download the segments in <list> into <dest>\n\
  digest <file> <md5|sha1|sha256> Print a file digest\n\
  config                          Print the default config as JSON\n\
Fetch options:\n\
  --config FILE        Load engine config from JSON\n\
  --workers N          Parallel workers\n\
  --attempts N         Attempts per segment\n\
  --delay-ms N         Base retry delay\n\
  --limit BPS          Speed limit in bytes per second\n\
  --compact-at BYTES   Compaction threshold per worker file\n\
  --temp-dir DIR       Where worker temp files go\n\
  --proxy URL          HTTP proxy\n\
  --checksum TYPE:HEX  Verify the merged output\n\
  --fail-fast BOOL     Abort on the first transient error\n\
List format:\n\
  JSON array of {{\"uri\": ..., \"expected_size\": ...}} or one 'uri [size]' per line\n\
Environment:\n\
  RUST_LOG             Log filter (default info)"
    );
}

struct PrintState {
    last_line: Instant,
    last_bytes: u64,
}

fn progress_printer(dest: &Path) -> ProgressCallback {
    let name = dest
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("download")
        .to_string();
    let state = Mutex::new(PrintState {
        last_line: Instant::now(),
        last_bytes: 0,
    });
    Arc::new(move |event: &ProgressEvent| match event {
        ProgressEvent::Started {
            segments,
            workers,
            total,
        } => {
            let total = total.map(format_bytes).unwrap_or_else(|| "?".to_string());
            println!("{}: {} segments, {} workers, {}", name, segments, workers, total);
        }
        ProgressEvent::Progress { downloaded, total } => {
            let Ok(mut state) = state.lock() else {
                return;
            };
            let now = Instant::now();
            let delta_secs = now.duration_since(state.last_line).as_secs_f64();
            if delta_secs < 1.0 {
                return;
            }
            let speed_bps = (downloaded.saturating_sub(state.last_bytes) as f64 / delta_secs) as u64;
            state.last_line = now;
            state.last_bytes = *downloaded;
            let (percent, eta) = match total {
                Some(total) if *total > 0 => {
                    let percent = format!("{:.1}%", (*downloaded as f64 / *total as f64) * 100.0);
                    let eta = if speed_bps > 0 {
                        format_duration(total.saturating_sub(*downloaded) / speed_bps)
                    } else {
                        "--:--".to_string()
                    };
                    (percent, eta)
                }
                _ => ("--".to_string(), "--:--".to_string()),
            };
            println!(
                "{} {}/{} ({}/s) eta {} {}",
                percent,
                format_bytes(*downloaded),
                total.map(format_bytes).unwrap_or_else(|| "?".to_string()),
                format_bytes(speed_bps),
                eta,
                name,
            );
        }
        ProgressEvent::Retrying {
            segment,
            remaining,
            waiting,
            ..
        } => {
            println!(
                "retrying segment {} in {}s ({} waiting)",
                segment,
                remaining.as_secs() + 1,
                waiting
            );
        }
        _ => {}
    })
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

fn format_duration(mut seconds: u64) -> String {
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}
