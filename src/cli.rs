use anyhow::{Context, Result, anyhow};
use log::info;
use pico_args::Arguments;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    env,
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use gesturectl::{
    bank::SequenceModelBank,
    buffer::{GestureBuffer, downsample},
    classifier::{Decision, GestureClassifier, SoftmaxRegression},
    config::Config,
    dataset::{Dataset, read_example},
    frame::{FrameSource, JsonLinesSource, LatestFrameSlot},
    harness::{TrainingHarness, TrainingReport},
    pipeline::{SessionOptions, record_session, run_session},
    store::ModelStore,
    transport::sink_from_config,
};

pub fn run() -> Result<()> {
    let mut pargs = Arguments::from_env();

    // No args -> general help
    if env::args().len() == 1 {
        print_help();
        return Ok(());
    }

    // Flags-based help (-h/--help)
    if pargs.contains("-h") || pargs.contains("--help") {
        print_help();
        return Ok(());
    }

    let config_path: Option<PathBuf> = pargs.opt_value_from_str("--config")?;

    // First free arg is the subcommand
    let subcmd: Option<String> = pargs.free_from_str().ok();

    match subcmd.as_deref() {
        Some("help") => {
            let topic: Option<String> = pargs.free_from_str().ok();
            if let Some(t) = topic {
                print_subcmd_help(&t);
            } else {
                print_help();
            }
            Ok(())
        }

        Some("train") => {
            let seed: Option<u64> = pargs.opt_value_from_str("--seed")?;
            let (cfg, _) = load_config(config_path.as_deref())?;
            cmd_train(&cfg, seed)
        }

        Some("run") => {
            let frames: Option<PathBuf> = pargs.opt_value_from_str("--frames")?;
            let (cfg, _) = load_config(config_path.as_deref())?;
            cmd_run(&cfg, frames.as_deref())
        }

        Some("record") => {
            let frames: Option<PathBuf> = pargs.opt_value_from_str("--frames")?;
            let count: usize = pargs.opt_value_from_str("--count")?.unwrap_or(1);
            let class: String = pargs.free_from_str().map_err(|_| {
                anyhow!("usage: gesturectl record <class> [--frames PATH] [--count N]")
            })?;
            let (cfg, _) = load_config(config_path.as_deref())?;
            cmd_record(&cfg, &class, count, frames.as_deref())
        }

        Some("classify") => {
            let file: PathBuf = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: gesturectl classify <example-file>"))?;
            let (cfg, _) = load_config(config_path.as_deref())?;
            cmd_classify(&cfg, &file)
        }

        Some("config") => {
            let (cfg, path) = load_config(config_path.as_deref())?;
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(&cfg)?);
            Ok(())
        }

        Some(other) => {
            eprintln!("unknown subcommand: {other}\n");
            print_help();
            Ok(())
        }

        None => {
            print_help();
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<(Config, PathBuf)> {
    match path {
        Some(p) => Ok((Config::load(p)?, p.to_path_buf())),
        None => Config::load_or_install_default(),
    }
}

fn load_models(cfg: &Config) -> Result<(SequenceModelBank, GestureClassifier<SoftmaxRegression>)> {
    let store = ModelStore::new(cfg.model_dir()?);
    let (bank, model) = store.load()?;
    Ok((bank, GestureClassifier::new(model, cfg.classifier.threshold)))
}

/// Frames from `path`, or the newest frame read from stdin when absent.
/// The returned slot, if any, must be closed to unblock the reader on shutdown.
fn open_source(path: Option<&Path>) -> Result<(Box<dyn FrameSource>, Option<LatestFrameSlot>)> {
    match path {
        Some(p) => {
            let file = File::open(p).with_context(|| format!("cannot open {}", p.display()))?;
            info!("replaying frames from {}", p.display());
            Ok((Box::new(JsonLinesSource::new(BufReader::new(file))), None))
        }
        None => {
            info!("reading frames from stdin");
            let slot = LatestFrameSlot::spawn_reader(BufReader::new(io::stdin()));
            Ok((Box::new(slot.clone()), Some(slot)))
        }
    }
}

/// Raises the returned flag on SIGINT/SIGTERM.
fn stop_on_signal(slot: Option<LatestFrameSlot>) -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let flag = stop.clone();
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("received signal {sig}, stopping");
            flag.store(true, Ordering::Relaxed);
            if let Some(slot) = slot {
                slot.close();
            }
        }
    });
    Ok(stop)
}

fn cmd_train(cfg: &Config, seed: Option<u64>) -> Result<()> {
    let data_dir = cfg.data_dir()?;
    let dataset = Dataset::load(&data_dir, cfg.window.capacity)
        .with_context(|| format!("loading dataset from {}", data_dir.display()))?;
    let store = ModelStore::new(cfg.model_dir()?);
    let report = TrainingHarness::from_config(cfg)
        .with_seed(seed)
        .run(&dataset, &store)?;
    print_report(&report);
    println!("models saved to {}", store.dir().display());
    Ok(())
}

fn cmd_run(cfg: &Config, frames: Option<&Path>) -> Result<()> {
    let (bank, classifier) = load_models(cfg)?;
    let (mut source, slot) = open_source(frames)?;
    let stop = stop_on_signal(slot.clone())?;
    let mut sink = sink_from_config(&cfg.transport);
    let mut buffer = GestureBuffer::new(&cfg.window);

    let stats = run_session(
        source.as_mut(),
        &mut buffer,
        &bank,
        &classifier,
        sink.as_mut(),
        &stop,
        &SessionOptions::from_config(cfg),
    )?;
    let dropped = slot.map(|s| s.dropped()).unwrap_or(0);
    println!(
        "frames: {} (dropped {dropped}), gestures: {}, low-confidence: {}, resets: {}, send failures: {}",
        stats.frames, stats.gestures, stats.low_confidence, stats.resets, stats.send_failures
    );
    Ok(())
}

fn cmd_record(cfg: &Config, class: &str, count: usize, frames: Option<&Path>) -> Result<()> {
    let data_dir = cfg.data_dir()?;
    let (mut source, slot) = open_source(frames)?;
    let stop = stop_on_signal(slot)?;
    let mut buffer = GestureBuffer::new(&cfg.window);
    let saved = record_session(source.as_mut(), &mut buffer, &data_dir, class, count, &stop)?;
    for p in &saved {
        println!("saved {}", p.display());
    }
    Ok(())
}

fn cmd_classify(cfg: &Config, file: &Path) -> Result<()> {
    let (bank, classifier) = load_models(cfg)?;
    let full = read_example(file)?;
    let sequence = downsample(&full, cfg.window.stride);
    match classifier.classify_sequence(&bank, &sequence)? {
        Decision::Committed(m) => println!("Gesture {} (posterior {:.3})", m.label, m.posterior),
        Decision::NoConfidentMatch { best } => println!(
            "no confident match (best {} at {:.3}, threshold {})",
            best.label,
            best.posterior,
            classifier.threshold()
        ),
    }
    Ok(())
}

fn print_report(r: &TrainingReport) {
    println!("classes: {}", r.classes.join(", "));
    for (class, n) in &r.per_class_counts {
        println!("  {class:<16} {n} examples");
    }
    println!("split: {} train / {} test (seed {})", r.train_len, r.test_len, r.seed);
    match (r.average_correct_posterior, r.accuracy) {
        (Some(avg), Some(acc)) => {
            println!("average correct posterior: {avg:.3}, accuracy: {acc:.3}")
        }
        _ => println!("no test examples; evaluation skipped"),
    }
    for ex in &r.exceptions {
        println!(
            "  exception: {} scored {:.3} (predicted {})",
            ex.label, ex.posterior, ex.predicted
        );
    }
}

fn print_help() {
    println!(
        r#"gesturectl - hand gesture recognition

USAGE:
  gesturectl [--config PATH] <command>

COMMANDS:
  help [command]                          Show general or command-specific help
  train [--seed N]                        Train and evaluate models from the dataset
  run [--frames PATH]                     Recognize gestures from a frame stream
  record <class> [--frames PATH] [--count N]
                                          Record examples of a gesture class
  classify <example-file>                 Classify one recorded example
  config                                  Print the effective configuration

TIPS:
  - Config: ~/.config/gesturectl/config.toml (installed on first use)
  - Frames are JSON objects, one per line; stdin when --frames is absent
  - RUST_LOG=debug shows per-example model diagnostics during training
"#
    );
}

fn print_subcmd_help(cmd: &str) {
    match cmd {
        "train" => println!(
            "usage: gesturectl train [--seed N]\nFits one sequence model per class, trains the meta-classifier on a shuffled split, reports held-out accuracy and saves both models."
        ),
        "run" => println!(
            "usage: gesturectl run [--frames PATH]\nClassifies live windows and sends 'Gesture <label>' and hand state to the configured UDP target."
        ),
        "record" => println!(
            "usage: gesturectl record <class> [--frames PATH] [--count N]\nSaves each full window as <data_dir>/<class>/<n>.gesture."
        ),
        "classify" => println!(
            "usage: gesturectl classify <example-file>\nPrints the label and posterior for one recorded example."
        ),
        "config" => println!("usage: gesturectl config\nPrints the config path and effective values."),
        _ => {
            eprintln!("unknown command: {cmd}\n");
            print_help();
        }
    }
}
