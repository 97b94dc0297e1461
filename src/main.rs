use anyhow::Result;
use clap::Parser;
use layerpack::{
    cancel::Cancellation,
    cleanup,
    commands::{
        self, BuildArgs, InstallOptions, ManifestInput, PublishArgs,
        config::{AwsOptions, Config},
    },
    error::exit_code,
    pipeline::PublishTarget,
    publish::PublishOptions,
    router::{DEFAULT_DIRECT_UPLOAD_LIMIT, SizeRouter, parse_size},
    runtime::RealRuntime,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// layerpack - package Python dependencies as a Lambda layer
///
/// Reads requirement declarations, installs them with pip into a `python/`
/// folder, zips that folder deterministically and publishes it as a new
/// layer version. Archives above the direct upload limit are staged in S3.
///
/// AWS credentials are read from AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY and
/// AWS_SESSION_TOKEN.
///
/// Examples:
///   layerpack build -r requirements.txt --layer deps --runtime python3.12
///   layerpack publish layer.zip --layer deps --runtime python3.12
#[derive(Parser, Debug)]
#[command(author, version = env!("LAYERPACK_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log output (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// AWS region (defaults to AWS_REGION / AWS_DEFAULT_REGION)
    #[arg(long, value_name = "REGION", global = true)]
    region: Option<String>,

    /// Endpoint for every AWS service, e.g. a local emulator
    #[arg(long, env = "AWS_ENDPOINT_URL", value_name = "URL", global = true)]
    endpoint_url: Option<String>,

    /// Cancel the run after this many seconds
    #[arg(long, value_name = "SECONDS", global = true)]
    timeout: Option<u64>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Validate a manifest
    Check(ManifestArgs),

    /// Install packages into an install root
    Install(InstallArgs),

    /// Zip an install root into a layer archive
    Archive(ArchiveArgs),

    /// List the contents of a layer archive and check its layout
    Inspect(InspectArgs),

    /// Publish a pre-built layer archive
    Publish(PublishCliArgs),

    /// Install, archive and publish in one run
    Build(BuildCliArgs),

    /// Attach a layer version to a function
    Attach(AttachArgs),
}

#[derive(clap::Args, Debug)]
struct ManifestArgs {
    /// Requirements file; may be repeated
    #[arg(short = 'r', long = "requirements", value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Package declarations, e.g. "numpy==1.26.4"
    #[arg(value_name = "PACKAGE")]
    packages: Vec<String>,
}

impl From<ManifestArgs> for ManifestInput {
    fn from(args: ManifestArgs) -> Self {
        ManifestInput {
            files: args.files,
            packages: args.packages,
        }
    }
}

#[derive(clap::Args, Debug)]
struct InstallerArgs {
    /// Install root; its contents are replaced
    #[arg(long, value_name = "DIR", default_value = "build/layer")]
    root: PathBuf,

    /// Python interpreter used to run pip
    #[arg(long, env = "LAYERPACK_PYTHON", default_value = "python3")]
    python: String,

    /// Target platform tag, e.g. manylinux2014_x86_64 (wheels only)
    #[arg(long, value_name = "TAG")]
    platform: Option<String>,

    /// Target Python version, e.g. 3.12 (wheels only)
    #[arg(long, value_name = "VERSION")]
    python_version: Option<String>,

    /// Package index URL passed to pip
    #[arg(long, value_name = "URL")]
    index_url: Option<String>,
}

impl From<InstallerArgs> for InstallOptions {
    fn from(args: InstallerArgs) -> Self {
        InstallOptions {
            root: args.root,
            python: args.python,
            platform: args.platform,
            python_version: args.python_version,
            index_url: args.index_url,
        }
    }
}

#[derive(clap::Args, Debug)]
struct InstallArgs {
    #[command(flatten)]
    manifest: ManifestArgs,

    #[command(flatten)]
    installer: InstallerArgs,
}

#[derive(clap::Args, Debug)]
struct ArchiveArgs {
    /// Install root to archive
    #[arg(long, value_name = "DIR", default_value = "build/layer")]
    root: PathBuf,

    /// Archive path
    #[arg(short, long, value_name = "FILE", default_value = "build/layer.zip")]
    output: PathBuf,

    /// Glob pattern of files or directories to leave out; may be repeated
    #[arg(long = "exclude", value_name = "PATTERN")]
    excludes: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct InspectArgs {
    /// Archive to inspect
    #[arg(value_name = "FILE")]
    archive: PathBuf,

    /// Direct upload limit used to report the route, e.g. 50MB
    #[arg(long, value_name = "SIZE", value_parser = size_arg)]
    direct_upload_limit: Option<u64>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct LayerArgs {
    /// Layer name
    #[arg(long = "layer", value_name = "NAME")]
    layer_name: String,

    /// Compatible runtime, e.g. python3.12; may be repeated
    #[arg(long = "runtime", value_name = "RUNTIME")]
    runtimes: Vec<String>,

    /// Compatible architecture (x86_64 or arm64); may be repeated
    #[arg(long = "architecture", value_name = "ARCH")]
    architectures: Vec<String>,

    #[arg(long)]
    description: Option<String>,

    /// License identifier or URL
    #[arg(long = "license", value_name = "LICENSE")]
    license_info: Option<String>,

    /// Largest archive sent inline, e.g. 50MB or 52428800
    #[arg(long, value_name = "SIZE", value_parser = size_arg)]
    direct_upload_limit: Option<u64>,

    /// S3 bucket for archives above the direct upload limit
    #[arg(long, value_name = "BUCKET")]
    staging_bucket: Option<String>,

    /// Key prefix for staged archives
    #[arg(long, value_name = "PREFIX", default_value = "layerpack")]
    staging_prefix: String,

    /// Publish ledger location (defaults to ~/.layerpack/state.json)
    #[arg(long, env = "LAYERPACK_STATE_FILE", value_name = "FILE")]
    state_file: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

impl LayerArgs {
    fn target(&self) -> PublishTarget {
        let options = PublishOptions {
            compatible_runtimes: self.runtimes.clone(),
            compatible_architectures: self.architectures.clone(),
            description: self.description.clone(),
            license_info: self.license_info.clone(),
        };
        let mut target = PublishTarget::new(&self.layer_name, options);
        target.router = SizeRouter::new(
            self.direct_upload_limit
                .unwrap_or(DEFAULT_DIRECT_UPLOAD_LIMIT),
        );
        target.staging_bucket = self.staging_bucket.clone();
        target.staging_prefix = self.staging_prefix.clone();
        target
    }
}

#[derive(clap::Args, Debug)]
struct PublishCliArgs {
    /// Layer archive to publish
    #[arg(value_name = "FILE")]
    archive: PathBuf,

    #[command(flatten)]
    layer: LayerArgs,
}

#[derive(clap::Args, Debug)]
struct BuildCliArgs {
    #[command(flatten)]
    manifest: ManifestArgs,

    #[command(flatten)]
    installer: InstallerArgs,

    #[command(flatten)]
    layer: LayerArgs,

    /// Archive path
    #[arg(short, long, value_name = "FILE", default_value = "build/layer.zip")]
    output: PathBuf,

    /// Glob pattern of files or directories to leave out; may be repeated
    #[arg(long = "exclude", value_name = "PATTERN")]
    excludes: Vec<String>,

    /// Skip publishing when the archive matches the last published one
    #[arg(long)]
    skip_unchanged: bool,
}

#[derive(clap::Args, Debug)]
struct AttachArgs {
    /// Function name or ARN
    #[arg(value_name = "FUNCTION")]
    function: String,

    /// Layer version ARN to attach
    #[arg(value_name = "LAYER_VERSION_ARN")]
    layer_version_arn: String,
}

fn size_arg(value: &str) -> Result<u64, String> {
    parse_size(value).map_err(|e| e.to_string())
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level(cli.verbose)),
    )
    .init();

    let cancel = Cancellation::new();
    let cleanup_ctx = cleanup::new_shared();
    let interrupt = commands::spawn_interrupt_handler(cancel.clone(), cleanup_ctx.clone());
    if let Some(seconds) = cli.timeout {
        cancel.cancel_after(Duration::from_secs(seconds));
    }

    let result = run(cli, &cancel, cleanup_ctx).await;
    interrupt.abort();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(
    cli: Cli,
    cancel: &Cancellation,
    cleanup_ctx: cleanup::SharedCleanupContext,
) -> Result<()> {
    let runtime = RealRuntime;
    let aws = AwsOptions {
        region: cli.region,
        endpoint_url: cli.endpoint_url,
    };

    match cli.command {
        Commands::Check(args) => commands::check(runtime, &args.into()),
        Commands::Install(args) => {
            commands::install(
                runtime,
                &args.manifest.into(),
                &args.installer.into(),
                cancel,
                cleanup_ctx,
            )
            .await
        }
        Commands::Archive(args) => commands::archive(
            runtime,
            &args.root,
            &args.output,
            &args.excludes,
            cleanup_ctx,
        ),
        Commands::Inspect(args) => {
            let router = SizeRouter::new(
                args.direct_upload_limit
                    .unwrap_or(DEFAULT_DIRECT_UPLOAD_LIMIT),
            );
            commands::inspect(runtime, &args.archive, router, args.json)
        }
        Commands::Publish(args) => {
            let publish_args = PublishArgs {
                archive: args.archive,
                target: args.layer.target(),
                state_file: args.layer.state_file.clone(),
                json: args.layer.json,
            };
            commands::publish(Config::new(runtime, aws)?, &publish_args, cancel).await
        }
        Commands::Build(args) => {
            let build_args = BuildArgs {
                target: args.layer.target(),
                state_file: args.layer.state_file.clone(),
                json: args.layer.json,
                input: args.manifest.into(),
                install: args.installer.into(),
                output: args.output,
                excludes: args.excludes,
                skip_unchanged: args.skip_unchanged,
            };
            commands::build(Config::new(runtime, aws)?, &build_args, cancel, cleanup_ctx).await
        }
        Commands::Attach(args) => {
            commands::attach(
                Config::new(runtime, aws)?,
                &args.function,
                &args.layer_version_arn,
            )
            .await
        }
    }
}
