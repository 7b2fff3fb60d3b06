use std::{path::PathBuf, process::ExitCode};

use lumbung::{
    recovery::{RecoveryConfig, recover},
    script::ScriptRunner,
    storage::{config::DatabaseConfig, database::Database},
    types::error::DatabaseError,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

const USAGE: &str = r#"Usage: lumbung-recover --dir <directory> --db <name> [options]

Rebuilds <directory>/<name>.lumbung.sql from the raw pages of
<directory>/<name>.lumbung.db.

Options:
  --dir, -dir <directory>   Directory holding the database (default: .)
  --db, -db <name>          Database name
  --ext <extension>         Script name becomes <name>.<extension>.sql
  --no-warnings             Leave the warning comment block out of the script
  --verify                  Replay the script into a scratch database
  --help, -h                Show this message
"#;

struct Args {
    config: RecoveryConfig,
    verify: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<Args>, String> {
    let mut dir = PathBuf::from(".");
    let mut name = None;
    let mut extension = None;
    let mut warnings = true;
    let mut verify = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dir" | "-dir" => {
                dir = args
                    .next()
                    .map(PathBuf::from)
                    .ok_or("--dir needs a directory")?
            }
            "--db" | "-db" => name = Some(args.next().ok_or("--db needs a name")?),
            "--ext" | "-ext" => extension = Some(args.next().ok_or("--ext needs a value")?),
            "--no-warnings" => warnings = false,
            "--verify" | "-verify" => verify = true,
            "--help" | "-h" | "-help" => return Ok(None),
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }

    let name = name.ok_or("--db is required")?;
    let mut config = RecoveryConfig::new(dir, name).with_warnings_in_script(warnings);
    if let Some(extension) = extension {
        config = config.with_extension(extension);
    }
    Ok(Some(Args { config, verify }))
}

fn verify(script: &std::path::Path) -> Result<(), DatabaseError> {
    let scratch = tempfile::tempdir()?;
    let db = Database::open(
        scratch.path(),
        "verify",
        DatabaseConfig::default().with_sync_on_commit(false),
    )?;
    let stats = ScriptRunner::new(&db).run_file(script)?;
    println!(
        "verify: replayed {} table(s), {} index(es), {} row(s)",
        stats.tables, stats.indexes, stats.rows
    );
    for table in db.tables() {
        println!("  {}: {} row(s)", table.name, db.scan_table(&table.name)?.len());
    }
    db.close()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(Some(args)) => args,
        Ok(None) => {
            print!("{}", USAGE);
            return ExitCode::SUCCESS;
        }
        Err(message) => {
            eprintln!("{}\n\n{}", message, USAGE);
            return ExitCode::from(2);
        }
    };

    let report = match recover(&args.config) {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "recovery failed");
            return ExitCode::FAILURE;
        }
    };
    print!("{}", report);

    if args.verify {
        if let Err(err) = verify(&report.script_path) {
            error!(error = %err, "script verification failed");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}
