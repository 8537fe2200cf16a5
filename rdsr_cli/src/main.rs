use chrono::{Duration as ChronoDuration, Utc};
use clap::{ArgAction, Parser, Subcommand};
use rdsr_core::audit::{AuditEvent, AuditEventType, Outcome};
use rdsr_core::calibration::{self, CalibrationCoefficients};
use rdsr_core::dap::await_mas;
use rdsr_core::notify::TracingNotifier;
use rdsr_core::threshold::ThresholdAdvisor;
use rdsr_core::*;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "rdsr")]
#[command(about = "Radiation dose capture, audit and dose report export", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (repeatable)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and a signed calibration file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Calibration file tools
    Calibration {
        #[command(subcommand)]
        command: CalibrationCommands,
    },

    /// Study workflow
    Study {
        #[command(subcommand)]
        command: StudyCommands,
    },

    /// Audit trail tools
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },

    /// Resolve temporary artifacts left by an interrupted run
    Recover,

    /// Export queue tools
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Write every dose record to a CSV file
    ExportCsv {
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum CalibrationCommands {
    /// Sign a coefficient set with the configured key
    Sign {
        /// k-factor
        #[arg(long)]
        k: f64,
        /// kVp exponent
        #[arg(long)]
        n: f64,
        /// Calibration constant
        #[arg(long)]
        c: f64,
        #[arg(long, default_value_t = 1)]
        version: u32,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum StudyCommands {
    /// Open a study, record its exposures, close it and export the report
    Run {
        #[arg(long)]
        study: String,
        #[arg(long)]
        patient: String,
        #[arg(long, default_value = "ANONYMOUS")]
        patient_name: String,
        #[arg(long)]
        accession: Option<String>,
        #[arg(long)]
        exam_type: String,
        #[arg(long, default_value = "DX")]
        modality: String,
        #[arg(long, default_value = "dx-1")]
        device: String,
        /// kvp,mas,sid_cm,width_mm,height_mm[,measured_dap]; use `-` for a missing mAs
        #[arg(long = "exposure", required = true, value_parser = parse_exposure)]
        exposures: Vec<ExposureArg>,
        /// Leave the report in the queue instead of attempting delivery
        #[arg(long)]
        no_dispatch: bool,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Verify the hash chain; exits non-zero on a break
    Verify,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Show every queue item
    List,
    /// Attempt delivery of every due item once
    Dispatch,
    /// Give a failed item a fresh retry budget
    Requeue { id: Uuid },
}

/// One `--exposure` argument
#[derive(Clone, Debug)]
struct ExposureArg {
    kvp: f64,
    mas: Option<f64>,
    sid_cm: f64,
    width_mm: f64,
    height_mm: f64,
    measured_dap: Option<f64>,
}

fn parse_exposure(value: &str) -> std::result::Result<ExposureArg, String> {
    let fields: Vec<&str> = value.split(',').map(str::trim).collect();
    if fields.len() != 5 && fields.len() != 6 {
        return Err(format!(
            "expected kvp,mas,sid_cm,width_mm,height_mm[,measured_dap], got '{}'",
            value
        ));
    }
    let number = |name: &str, field: &str| {
        field
            .parse::<f64>()
            .map_err(|_| format!("{} '{}' is not a number", name, field))
    };

    Ok(ExposureArg {
        kvp: number("kvp", fields[0])?,
        mas: match fields[1] {
            "-" => None,
            field => Some(number("mas", field)?),
        },
        sid_cm: number("sid_cm", fields[2])?,
        width_mm: number("width_mm", fields[3])?,
        height_mm: number("height_mm", fields[4])?,
        measured_dap: fields.get(5).map(|f| number("measured_dap", f)).transpose()?,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    rdsr_core::logging::init_with_level(rdsr_core::logging::level_for_verbosity(
        cli.quiet,
        cli.verbose,
    ));

    let config_path = cli.config.clone().unwrap_or_else(Config::default_config_path);

    if let Commands::Init { force } = cli.command {
        return cmd_init(&config_path, cli.data_dir, force);
    }

    let mut config = if config_path.exists() {
        Config::load_from(&config_path)?
    } else {
        tracing::info!("No config file found at {:?}, using defaults", config_path);
        Config::default()
    };
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Calibration {
            command:
                CalibrationCommands::Sign {
                    k,
                    n,
                    c,
                    version,
                    out,
                },
        } => cmd_calibration_sign(&config, k, n, c, version, &out),
        Commands::Study {
            command:
                StudyCommands::Run {
                    study,
                    patient,
                    patient_name,
                    accession,
                    exam_type,
                    modality,
                    device,
                    exposures,
                    no_dispatch,
                },
        } => {
            let info = StudyInfo {
                study_id: study,
                patient_id: patient,
                patient_name: Some(patient_name),
                patient_birth_date: None,
                patient_sex: None,
                accession_number: accession,
                modality,
                exam_type,
            };
            cmd_study_run(&config, info, &device, &exposures, no_dispatch)
        }
        Commands::Audit {
            command: AuditCommands::Verify,
        } => cmd_audit_verify(&config),
        Commands::Recover => cmd_recover(&config),
        Commands::Queue { command } => cmd_queue(&config, command),
        Commands::ExportCsv { out } => cmd_export_csv(&config, &out),
    }
}

/// Storage shared by every command that touches the data directory
struct Services {
    audit: Arc<AuditTrail>,
    ledger: Arc<DoseLedger>,
    queue: Arc<ExportQueue>,
    ledger_recovery: storage::RecoveryReport,
}

/// Open storage, running startup recovery on the ledger and the queue
fn open_services(config: &Config) -> Result<Services> {
    let audit = Arc::new(AuditTrail::open(config.audit_log_path())?);
    let ledger = Arc::new(DoseLedger::open(config.ledger_dir())?);

    let ledger_recovery = ledger.recover()?;
    audit.append(
        AuditEvent::new(AuditEventType::LedgerRecovered, Outcome::Success)
            .detail("promoted", ledger_recovery.promoted.to_string())
            .detail("discarded", ledger_recovery.discarded.to_string()),
    )?;

    let queue = Arc::new(ExportQueue::open(
        config.queue_dir(),
        config.retry.clone(),
        Arc::clone(&audit),
        Arc::new(TracingNotifier),
    )?);

    Ok(Services {
        audit,
        ledger,
        queue,
        ledger_recovery,
    })
}

fn signing_key(config: &Config) -> Result<SigningKey> {
    SigningKey::resolve(config.calibration.signing_key.as_deref())
}

fn generate_key_hex() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn cmd_init(config_path: &Path, data_dir: Option<PathBuf>, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{:?} already exists (use --force to overwrite)",
            config_path
        )));
    }

    let mut config = Config::default();
    if let Some(data_dir) = data_dir {
        config.data.data_dir = data_dir;
    }
    config.calibration.signing_key = Some(generate_key_hex());
    std::fs::create_dir_all(&config.data.data_dir)?;
    config.save_to(config_path)?;

    let coefficients = CalibrationCoefficients {
        k_factor: 0.0120,
        exponent: 2.5,
        calibration_constant: 1.02,
        version: 1,
        issued_at: Utc::now(),
    };
    let signed = calibration::sign(coefficients, &signing_key(&config)?)?;
    calibration::write_signed(&config.calibration_path(), &signed)?;

    println!("Config:      {}", config_path.display());
    println!("Data dir:    {}", config.data.data_dir.display());
    println!("Calibration: {}", config.calibration_path().display());
    Ok(())
}

fn cmd_calibration_sign(
    config: &Config,
    k: f64,
    n: f64,
    c: f64,
    version: u32,
    out: &Path,
) -> Result<()> {
    let coefficients = CalibrationCoefficients {
        k_factor: k,
        exponent: n,
        calibration_constant: c,
        version,
        issued_at: Utc::now(),
    };
    let signed = calibration::sign(coefficients, &signing_key(config)?)?;
    calibration::verify(&signed, &signing_key(config)?).map_err(Error::CalibrationRejected)?;
    calibration::write_signed(out, &signed)?;
    println!("Signed calibration v{} written to {}", version, out.display());
    Ok(())
}

fn cmd_study_run(
    config: &Config,
    info: StudyInfo,
    device: &str,
    exposures: &[ExposureArg],
    no_dispatch: bool,
) -> Result<()> {
    let services = open_services(config)?;
    let calibration = Arc::new(CalibrationStore::open(
        config.calibration_path(),
        signing_key(config)?,
        Arc::clone(&services.audit),
    )?);
    let transport: Arc<dyn Transport> = Arc::new(FileDropTransport::new(config.outbox_dir()));

    let mut pipeline = Pipeline::start(PipelineComponents {
        calculator: Arc::new(DapCalculator::new(Arc::clone(&calibration))),
        store: services.ledger.clone(),
        audit: Arc::clone(&services.audit),
        advisor: ThresholdAdvisor::new(config.reference_levels.clone()),
        builder: Arc::new(DoseReportBuilder::default()),
        export: services.queue.clone(),
        notifier: Arc::new(TracingNotifier),
        calibration: Some(calibration),
        destination: config.export.destination.clone(),
    })?;
    if !no_dispatch {
        pipeline.attach_dispatcher(export_queue::Dispatcher::spawn(
            Arc::clone(&services.queue),
            Arc::clone(&transport),
            config.dispatch_interval(),
            config.delivery_timeout(),
        )?);
    }

    let key = info.key();
    let closed = pipeline.subscribe_study_closed();
    pipeline.open_study(info)?;

    let started = Utc::now();
    for (i, arg) in exposures.iter().enumerate() {
        // The generator reports mAs separately; a missing value is a source
        // that never sends
        let (tx, rx) = mpsc::channel();
        if let Some(mas) = arg.mas {
            let _ = tx.send(mas);
        }
        drop(tx);

        pipeline.record_exposure(ExposureEvent {
            exposure_id: None,
            device_id: device.to_string(),
            study: Some(key.clone()),
            params: ExposureParameters {
                kvp: arg.kvp,
                mas: await_mas(&rx, config.mas_timeout()),
                filter: String::new(),
                timestamp: started + ChronoDuration::milliseconds(i as i64),
            },
            geometry: DetectorGeometry {
                sid_cm: arg.sid_cm,
                field_width_mm: arg.width_mm,
                field_height_mm: arg.height_mm,
            },
            measured_dap: arg.measured_dap,
        })?;
    }
    pipeline.notify_study_closed(&key.study_id, &key.patient_id)?;

    let queries = pipeline.queries().clone();
    pipeline.shutdown();

    // Everything closed in this run gets one attempt before exit
    if !no_dispatch {
        services
            .queue
            .dispatch_due(&transport, Utc::now(), config.delivery_timeout())?;
    }

    let summary = queries
        .get_study_summary(&key.study_id)?
        .ok_or_else(|| Error::Study(format!("study {} was not recorded", key)))?;
    let closed = closed.try_recv().ok();

    println!("Study {} / patient {}", summary.study_id, summary.patient_id);
    println!("  Exposures:  {}", summary.exposure_count);
    println!("  Total DAP:  {:.6} Gy·cm²", summary.total_dap);
    println!(
        "  Threshold:  {}",
        if summary.threshold_exceeded {
            "exceeded"
        } else {
            "not exceeded"
        }
    );
    match closed.and_then(|event| event.export_item) {
        Some(id) => {
            let state = services
                .queue
                .get(id)
                .map(|item| format!("{:?}", item.state).to_lowercase())
                .unwrap_or_else(|| "unknown".into());
            println!("  Report:     {} ({})", id, state);
        }
        None => println!("  Report:     not built (see audit log)"),
    }
    Ok(())
}

fn cmd_audit_verify(config: &Config) -> Result<()> {
    let audit = AuditTrail::open(config.audit_log_path())?;
    let report = audit.verify_and_record()?;

    match &report.status {
        ChainStatus::Intact => {
            println!("Audit chain intact: {} entries", report.entries);
            Ok(())
        }
        ChainStatus::Broken { index, reason } => {
            println!("Audit chain BROKEN at entry {}: {}", index, reason);
            println!("Entries before {} are intact", index);
            report.into_result().map(|_| ())
        }
    }
}

fn cmd_recover(config: &Config) -> Result<()> {
    let services = open_services(config)?;
    let queue = services.queue.recovered();
    println!(
        "Ledger: {} promoted, {} discarded",
        services.ledger_recovery.promoted, services.ledger_recovery.discarded
    );
    println!(
        "Queue:  {} promoted, {} discarded, {} active items",
        queue.promoted,
        queue.discarded,
        services.queue.active_count()
    );
    Ok(())
}

fn cmd_queue(config: &Config, command: QueueCommands) -> Result<()> {
    let services = open_services(config)?;
    match command {
        QueueCommands::List => {
            let items = services.queue.items();
            if items.is_empty() {
                println!("Queue is empty");
            }
            for item in items {
                println!(
                    "{}  {:<9} attempts={}  study={}  destination={}{}",
                    item.id,
                    format!("{:?}", item.state).to_lowercase(),
                    item.attempts,
                    item.study_id,
                    item.destination,
                    item.last_error
                        .map(|e| format!("  error={}", e))
                        .unwrap_or_default()
                );
            }
        }
        QueueCommands::Dispatch => {
            let transport: Arc<dyn Transport> =
                Arc::new(FileDropTransport::new(config.outbox_dir()));
            let summary =
                services
                    .queue
                    .dispatch_due(&transport, Utc::now(), config.delivery_timeout())?;
            println!(
                "Attempted {}: {} delivered, {} retrying, {} failed",
                summary.attempted, summary.delivered, summary.retried, summary.failed
            );
        }
        QueueCommands::Requeue { id } => {
            let item = services.queue.requeue(id, Utc::now())?;
            println!("Requeued {} as {}", id, item.id);
        }
    }
    Ok(())
}

fn cmd_export_csv(config: &Config, out: &Path) -> Result<()> {
    let services = open_services(config)?;
    let count = services.ledger.export_csv(out)?;
    println!("Exported {} records to {}", count, out.display());
    Ok(())
}
