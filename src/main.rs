use anyhow::bail;
use clap::{Arg, ArgAction, ArgMatches, Command};
use dtverify::{config, CancelToken, Exerciser, RunSummary};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("dtverify")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Write, read back and verify data patterns on files and block devices")
        .arg(
            Arg::new("target")
                .help("File or block device to exercise")
                .required_unless_present("config-init")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("pattern")
                .long("pattern")
                .short('p')
                .help("0x hex number, incr, file:<path>, text:<string> or plain text"),
        )
        .arg(
            Arg::new("pattern-size")
                .long("pattern-size")
                .help("Circular pattern buffer size (e.g. 64k)"),
        )
        .arg(
            Arg::new("lbdata-size")
                .long("lbdata-size")
                .help("Logical block size for embedded addresses and tags"),
        )
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .help("String written at the start of every logical block"),
        )
        .arg(
            Arg::new("lbdata")
                .long("lbdata")
                .help("Embed the logical block address in every block")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("iot")
                .long("iot")
                .help("IOT data: every word derived from the block address")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("btags")
                .long("btags")
                .help("Write a self-describing tag at the start of every block")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("timestamps")
                .long("timestamps")
                .help("Stamp every addressed block with the write time")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("prefix-check")
                .long("prefix-check")
                .help("Also verify the prefix of tagged blocks")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .short('j')
                .help("Number of workers, one slice each")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("range")
                .long("range")
                .short('r')
                .help("Bytes of the target to exercise (e.g. 1g)"),
        )
        .arg(
            Arg::new("device-size")
                .long("device-size")
                .help("Slice and request alignment"),
        )
        .arg(
            Arg::new("request-size")
                .long("request-size")
                .short('b')
                .help("Bytes per read or write request"),
        )
        .arg(
            Arg::new("access")
                .long("access")
                .help("Access pattern")
                .value_parser(["sequential", "random"]),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .short('m')
                .help("I/O mode")
                .value_parser(["readwrite", "write", "read"]),
        )
        .arg(
            Arg::new("passes")
                .long("passes")
                .help("Number of passes over every slice")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .help("Random offset seed")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("error-limit")
                .long("error-limit")
                .help("Mismatches per worker before it stops, 0 for no limit")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("reread")
                .long("reread")
                .help("Re-read miscompared random-access requests to classify the fault")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("loop-on-error")
                .long("loop-on-error")
                .help("Keep re-reading a miscompared request")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("retry-delay")
                .long("retry-delay")
                .help("Base delay between re-reads in milliseconds")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("retry-limit")
                .long("retry-limit")
                .help("Maximum re-read attempts, 0 for no limit")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("dump-limit")
                .long("dump-limit")
                .help("Bytes shown in a miscompare dump")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("no-dump")
                .long("no-dump")
                .help("Disable miscompare dumps")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("trigger")
                .long("trigger")
                .help("Command run on every miscompare"),
        )
        .arg(
            Arg::new("no-progress")
                .long("no-progress")
                .help("Disable progress bar")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config-init")
                .long("config-init")
                .help("Create default config file and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .help("Debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .short('q')
                .help("No logging")
                .conflicts_with("verbose")
                .action(ArgAction::SetTrue),
        )
}

fn init_tracing(matches: &ArgMatches) {
    let filter = if matches.get_flag("verbose") {
        EnvFilter::new("dtverify=debug")
    } else if matches.get_flag("quiet") {
        EnvFilter::new("off")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// CLI arguments take precedence over config file values.
fn apply_args(matches: &ArgMatches, file: &mut config::ConfigFile) -> anyhow::Result<()> {
    if let Some(pattern) = matches.get_one::<String>("pattern") {
        file.pattern.set_source(config::parse_pattern(pattern)?);
    }
    if let Some(size) = matches.get_one::<String>("pattern-size") {
        file.pattern.buffer_size = usize::try_from(config::parse_size(size)?)?;
    }

    let encoding = &mut file.encoding;
    if let Some(size) = matches.get_one::<String>("lbdata-size") {
        encoding.lbdata_size = usize::try_from(config::parse_size(size)?)?;
    }
    if let Some(prefix) = matches.get_one::<String>("prefix") {
        encoding.prefix = Some(prefix.clone());
    }
    encoding.lbdata |= matches.get_flag("lbdata");
    encoding.iot |= matches.get_flag("iot");
    encoding.tagged |= matches.get_flag("btags");
    encoding.timestamps |= matches.get_flag("timestamps");
    encoding.prefix_cross_check |= matches.get_flag("prefix-check");

    let workload = &mut file.workload;
    if let Some(workers) = matches.get_one::<usize>("workers") {
        workload.workers = *workers;
    }
    if let Some(range) = matches.get_one::<String>("range") {
        workload.total_range = range.clone();
    }
    if let Some(size) = matches.get_one::<String>("device-size") {
        workload.device_size = size.clone();
    }
    if let Some(size) = matches.get_one::<String>("request-size") {
        workload.request_size = size.clone();
    }
    if let Some(access) = matches.get_one::<String>("access") {
        workload.access = access.clone();
    }
    if let Some(mode) = matches.get_one::<String>("mode") {
        workload.mode = mode.clone();
    }
    if let Some(passes) = matches.get_one::<u32>("passes") {
        workload.passes = *passes;
    }
    if let Some(seed) = matches.get_one::<u64>("seed") {
        workload.seed = *seed;
    }
    if let Some(limit) = matches.get_one::<u64>("error-limit") {
        workload.error_limit = *limit;
    }

    let reread = &mut file.reread;
    reread.enabled |= matches.get_flag("reread");
    reread.loop_on_error |= matches.get_flag("loop-on-error");
    if let Some(delay) = matches.get_one::<u64>("retry-delay") {
        reread.retry_delay_ms = *delay;
    }
    if let Some(limit) = matches.get_one::<u32>("retry-limit") {
        reread.retry_limit = *limit;
    }

    let verify = &mut file.verify;
    if let Some(limit) = matches.get_one::<usize>("dump-limit") {
        verify.dump_limit = *limit;
    }
    if matches.get_flag("no-dump") {
        verify.dump = false;
    }
    if let Some(trigger) = matches.get_one::<String>("trigger") {
        verify.trigger_command = Some(trigger.clone());
    }

    file.defaults.progress &= !matches.get_flag("no-progress");
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Workers: {}", summary.workers);
    println!(
        "Written: {} records, {} bytes",
        summary.records_written, summary.bytes_written
    );
    println!(
        "Read:    {} records, {} bytes",
        summary.records_read, summary.bytes_read
    );
    println!("Miscompares: {}", summary.mismatches);
    for report in &summary.reports {
        println!("  {}", report);
    }
    for diagnosis in &summary.diagnoses {
        println!("  reread: {}", diagnosis);
    }
    if let Some(action) = summary.trigger_action {
        println!("Stopped by trigger: {:?}", action);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    if matches.get_flag("config-init") {
        let config_path = config::get_config_path()?;
        config::create_default_config(&config_path)?;
        println!(
            "✅ Default configuration created at: {}",
            config_path.display()
        );
        return Ok(());
    }

    init_tracing(&matches);

    let mut config_file = config::load_config().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config file: {}", e);
        eprintln!("Using default configuration");
        config::ConfigFile::default()
    });
    apply_args(&matches, &mut config_file)?;

    let target = match matches.get_one::<PathBuf>("target") {
        Some(target) => target.clone(),
        None => bail!("No target given"),
    };
    let exercise = config_file.exercise_config(target)?;

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping workers");
            on_interrupt.cancel();
        }
    });

    println!("dtverify - data pattern verification");
    println!("Target: {}", exercise.target.display());
    println!("Pattern: {}", exercise.pattern.name());

    let exerciser = Exerciser::new(exercise, cancel)?;
    println!("Encoding: {}", exerciser.encoder().strategy());

    let summary = exerciser.run().await?;
    print_summary(&summary);

    if summary.cancelled {
        bail!("Run cancelled");
    }
    if summary.mismatches > 0 {
        bail!("{} miscompare(s) detected", summary.mismatches);
    }
    println!("✅ All data verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config_file() -> anyhow::Result<()> {
        let matches = cli().try_get_matches_from([
            "dtverify",
            "/tmp/target",
            "--pattern",
            "0xa5a5",
            "--iot",
            "--range",
            "8m",
            "--access",
            "random",
            "--no-progress",
            "--retry-limit",
            "3",
        ])?;
        let mut file = config::ConfigFile::default();
        apply_args(&matches, &mut file)?;

        let exercise = file.exercise_config(PathBuf::from("/tmp/target"))?;
        assert!(exercise.encoding.iot);
        assert!(!exercise.progress);
        assert_eq!(exercise.workload.total_range, 8 << 20);
        assert_eq!(exercise.reread.retry_limit, 3);
        assert_eq!(
            exercise.pattern,
            dtverify::PatternSource::Numeric {
                value: 0xa5a5,
                width: 2
            }
        );
        Ok(())
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(cli()
            .try_get_matches_from(["dtverify", "/tmp/t", "-v", "-q"])
            .is_err());
    }
}
