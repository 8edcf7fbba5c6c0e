//! shell-relay binary entry point.

use std::process::ExitCode;

use shell_relay::cli::{self, Args};
use shell_relay::{logging, Config, ConnectionManager};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Try 'shell-relay --help' for more information.");
            return ExitCode::from(2);
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_with_filter(config.log_filter()) {
        eprintln!("warning: logging already initialized: {}", e);
    }
    info!("shell-relay v{}", env!("CARGO_PKG_VERSION"));

    let manager = ConnectionManager::new(config);
    manager.initialize().await;

    let code = run(&manager, &args).await;
    manager.shutdown().await;
    code
}

async fn run(manager: &ConnectionManager, args: &Args) -> ExitCode {
    if args.check {
        let results = manager.test_all_connections().await;
        let stats = manager.executor_stats();
        for (name, ok) in &results {
            let kind = stats
                .get(name)
                .map(|s| s.kind.as_str())
                .unwrap_or("unknown");
            println!("{:<16} {:<6} {}", name, kind, if *ok { "ok" } else { "FAILED" });
        }
        return if results.values().all(|ok| *ok) {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    let Some(command) = args.command_line() else {
        println!(
            "machines: {} (default: {})",
            manager.list_machines().join(", "),
            manager.default_machine()
        );
        return ExitCode::SUCCESS;
    };

    let executor = match manager.get_executor(args.machine.as_deref()) {
        Ok(executor) => executor,
        Err(e) => {
            error!(error = %e, "no executor");
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = executor
        .execute_command(&command, manager.config().shell_timeout())
        .await;

    if !result.ok {
        eprintln!("error: {}", result.error);
        return ExitCode::FAILURE;
    }

    if !result.stdout.is_empty() {
        println!("{}", result.stdout.trim_end());
    }
    if !result.stderr.is_empty() {
        eprintln!("{}", result.stderr.trim_end());
    }
    println!("[{}] exit code {}", result.target, result.returncode);

    match u8::try_from(result.returncode) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}
