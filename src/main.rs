use asttest::loader;
use asttest::runner::{self, DEFAULT_INSTALL_PATH, DEFAULT_LOG_FILENAME, RunOptions};
use asttest::schema;
use asttest::script::YamlEngine;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "asttest")]
#[command(about = "Run sandboxed acceptance tests against an installed Asterisk")]
#[command(version)]
struct Cli {
    /// Test root directories; every subdirectory of a root is one test
    #[arg(required_unless_present_any = ["single", "print_schema"])]
    test_dirs: Vec<PathBuf>,

    /// Name of the log file created in each test root
    #[arg(short = 'l', long = "log", value_name = "FILENAME", default_value = DEFAULT_LOG_FILENAME)]
    log_filename: String,

    /// Directory the system under test is installed in
    #[arg(short = 'a', long = "asterisk", value_name = "DIRECTORY", default_value = DEFAULT_INSTALL_PATH)]
    install_path: PathBuf,

    /// Version of the system under test, exposed to scripts as ${VERSION}
    #[arg(short = 'v', long = "asterisk-version", value_name = "VERSION")]
    asterisk_version: Option<String>,

    /// Warn instead of failing when tests could not run because of errors
    /// (ignored in single test mode)
    #[arg(short = 'w', long)]
    warn_on_error: bool,

    /// Run one test directory, logging to stdout; the exit status reports the result
    #[arg(short = 's', long = "single", value_name = "DIRECTORY", conflicts_with = "test_dirs")]
    single: Option<PathBuf>,

    /// Suite configuration file (overrides asttest.yaml in each test root)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output the test script schema and exit
    #[arg(long)]
    print_schema: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    if cli.print_schema {
        let schema = schema::generate_schema();
        match serde_json::to_string_pretty(&schema) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing schema: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let config = match cli.config {
        Some(ref path) => match loader::load_suite_config(path) {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("Error loading suite config: {e}");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let opts = RunOptions {
        log_filename: cli.log_filename,
        install_path: cli.install_path,
        version: cli.asterisk_version,
        warn_on_error: cli.warn_on_error,
        config,
    };
    let engine = YamlEngine;

    if let Some(dir) = cli.single {
        match runner::process_single_test(&dir, &opts, &engine) {
            Ok(failed) => std::process::exit(i32::from(failed)),
            Err(e) => {
                println!("Error running test: {e}");
                std::process::exit(1);
            }
        }
    }

    for root in &cli.test_dirs {
        let failed = match runner::process_test_dir(root, &opts, &engine) {
            Ok(failed) => failed,
            Err(e) => {
                eprintln!("{e}");
                true
            }
        };
        if failed {
            eprintln!("test suite failed, exiting...");
            std::process::exit(1);
        }
    }
}
