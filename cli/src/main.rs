use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_std::task;
use clap::Parser;
use service::batch_service::BatchService;
use service::unpack_service::UnpackService;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Automated UPX decompression tool")]
struct Cli {
    /// Input file or directory
    input: PathBuf,

    /// Output file name (for single file)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Process directory
    #[arg(short, long)]
    directory: bool,

    /// Process directory recursively
    #[arg(short, long)]
    recursive: bool,

    /// Force unpacking even if UPX signature not detected
    #[arg(short, long)]
    force: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Path to UPX executable
    #[arg(long)]
    upx_path: Option<PathBuf>,

    /// File extensions to process (comma-separated)
    #[arg(long, default_value = ".exe,.dll,.sys,.bin")]
    extensions: String,
}

/// Console logging only; default level is info, raised to debug by
/// --verbose, overridable with RUST_LOG.
fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// Normalizes a comma-separated extension list to lowercase dotted entries.
fn parse_extensions(csv: &str) -> HashSet<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|extension| !extension.is_empty())
        .map(|extension| {
            let extension = extension.to_lowercase();
            if extension.starts_with('.') {
                extension
            } else {
                format!(".{}", extension)
            }
        })
        .collect()
}

async fn run(args: Cli, unpack_service: Arc<UnpackService>) -> i32 {
    if args.directory {
        let extensions = parse_extensions(&args.extensions);
        println!("Processing directory: {}", args.input.display());
        let mut extension_list: Vec<&str> =
            extensions.iter().map(String::as_str).collect();
        extension_list.sort_unstable();
        println!("Extensions: {}", extension_list.join(", "));

        let batch_service = BatchService::new(unpack_service);
        match batch_service
            .process_directory(&args.input, args.recursive, &extensions, args.force)
            .await
        {
            Ok(summary) => {
                println!();
                println!(
                    "Results: {}/{} files successfully unpacked",
                    summary.succeeded(),
                    summary.attempted()
                );
                for result in summary.results() {
                    let status = if result.is_success() { "SUCCESS" } else { "FAILED" };
                    println!(
                        "[{}] {}: {}",
                        status,
                        result.input_path.display(),
                        result.message()
                    );
                }
                // partial failures are expected on noisy sample sets and do
                // not change the exit code once the batch itself ran
                0
            }
            Err(e) => {
                eprintln!("ERROR: {}", e);
                1
            }
        }
    } else {
        println!("Processing file: {}", args.input.display());
        match utils::signature::is_upx_packed(&args.input) {
            Ok(true) => println!("UPX signature detected"),
            Ok(false) if !args.force => {
                println!("WARNING: UPX signature not detected. Use --force to unpack anyway.")
            }
            _ => {}
        }

        let result = unpack_service
            .unpack_file(&args.input, args.output.as_deref(), args.force)
            .await;
        if result.is_success() {
            println!("SUCCESS: {}", result.message());
            0
        } else {
            println!("FAILED: {}", result.message());
            1
        }
    }
}

fn main() {
    let args = Cli::parse();
    init_logging(args.verbose);

    let unpack_service = match UnpackService::with_located_tool(args.upx_path.as_deref()) {
        Ok(unpack_service) => Arc::new(unpack_service),
        Err(e) => {
            eprintln!("ERROR: {}", e);
            eprintln!("Please install UPX or specify path with --upx-path");
            eprintln!("Download UPX from: https://upx.github.io/");
            std::process::exit(1);
        }
    };
    println!("Using UPX: {}", unpack_service.tool().path().display());

    let exit_code = task::block_on(run(args, unpack_service));
    std::process::exit(exit_code);
}
