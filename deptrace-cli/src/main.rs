//! deptrace CLI - コマンドラインインターフェース
//!
//! プログラムを実行し、アクセスしようとしたファイルパスとその存在有無を出力ファイルに記録します。

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use deptrace_core::{Process, TraceSession};
use std::ffi::OsString;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// 引数が不足している場合の終了コード
const EXIT_USAGE: u8 = 1;
/// 出力ファイルを開けない場合の終了コード
const EXIT_OUTPUT: u8 = 2;
/// 起動失敗やトレース中断時の終了コード
const EXIT_FAILURE: u8 = 1;

/// deptrace - file access tracer
#[derive(Parser)]
#[command(name = "deptrace")]
#[command(version = "0.1.0")]
#[command(about = "Trace the file paths a program tries to access and report whether each exists", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace). Overrides RUST_LOG
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// File to write the trace log to (truncated if it exists)
    output: PathBuf,

    /// Program to run, followed by its arguments
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
            _ => {
                let _ = e.print();
                return ExitCode::from(EXIT_USAGE);
            }
        },
    };

    init_logging(cli.verbose);

    let output = match File::create(&cli.output) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Error opening {} for writing: {}", cli.output.display(), e);
            return ExitCode::from(EXIT_OUTPUT);
        }
    };

    match run(&cli, BufWriter::new(output)) {
        Ok(code) => ExitCode::from((code & 0xff) as u8),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// ログ出力を初期化する（出力ファイルを汚さないよう標準エラーに書く）
fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// 子プロセスを起動してトレースし、子プロセスの終了コードを返す
fn run(cli: &Cli, sink: BufWriter<File>) -> Result<i32> {
    let (program, args) = cli
        .command
        .split_first()
        .context("No program given")?;

    let process = Process::spawn(program, args)
        .with_context(|| format!("Failed to start {}", program.to_string_lossy()))?;
    debug!("tracing {} as pid {}", program.to_string_lossy(), process.pid());

    let outcome = TraceSession::new(process, sink).run()?;
    debug!("traced program finished: {:?}", outcome);

    Ok(outcome.exit_code())
}
