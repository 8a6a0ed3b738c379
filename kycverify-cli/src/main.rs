//! `kycverify`: runs KYC verification batches from the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use eyre::{bail, WrapErr};
use secrecy::SecretString;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use kycverify_core::logger::{init_logging, DEFAULT_LOG_FILTER};
use kycverify_core::{
    cancellation, load_path, map_columns, BatchOptions, BatchOrchestrator, FallbackMode,
    FieldCipher, FieldName, IdentifierKind, JsonLinesOutcomeStore, KycConfig,
};

#[derive(Parser, Debug)]
#[command(name = "kycverify", version, about = "Batch KYC verification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify every row of a spreadsheet against the provider.
    Verify(VerifyArgs),
    /// Show how a spreadsheet's header maps onto canonical fields.
    Columns {
        /// Spreadsheet to inspect (.xlsx, .xls or .csv).
        #[arg(long, short = 'i')]
        input: PathBuf,
        /// Identifier the sheet carries.
        #[arg(long, default_value_t = IdentifierKind::Pan)]
        kind: IdentifierKind,
    },
    /// Encrypt a value with the field cipher.
    Encrypt(CipherArgs),
    /// Decrypt a value, printing a placeholder if that fails.
    Decrypt(CipherArgs),
    /// Print the keyed digest of a value.
    Hash(CipherArgs),
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Spreadsheet to verify (.xlsx, .xls or .csv).
    #[arg(long, short = 'i')]
    input: PathBuf,
    /// JSON lines file encrypted outcomes are appended to.
    #[arg(long, short = 'o', default_value = "kyc-outcomes.jsonl")]
    output: PathBuf,
    /// Batch identifier. Generated when omitted.
    #[arg(long)]
    batch_id: Option<Uuid>,
    /// Overrides `KYC_FALLBACK_MODE` for this run.
    #[arg(long)]
    mode: Option<FallbackMode>,
    /// Identifier the sheet carries.
    #[arg(long, default_value_t = IdentifierKind::Pan)]
    kind: IdentifierKind,
}

#[derive(Args, Debug)]
struct CipherArgs {
    /// Value to process.
    text: String,
    /// Passphrase the cipher keys are derived from.
    #[arg(long, env = "KYC_FIELD_CIPHER_KEY", hide_env_values = true)]
    cipher_key: String,
}

impl CipherArgs {
    fn cipher(&self) -> eyre::Result<FieldCipher> {
        Ok(FieldCipher::new(&SecretString::from(self.cipher_key.clone()))?)
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_logging(DEFAULT_LOG_FILTER)?;

    let cli = Cli::parse();
    match cli.command {
        Command::Verify(args) => verify(args).await,
        Command::Columns { input, kind } => columns(&input, kind),
        Command::Encrypt(args) => {
            println!("{}", args.cipher()?.encrypt(&args.text)?);
            Ok(())
        }
        Command::Decrypt(args) => {
            println!("{}", args.cipher()?.decrypt_for_display(&args.text));
            Ok(())
        }
        Command::Hash(args) => {
            println!("{}", args.cipher()?.hash(&args.text));
            Ok(())
        }
    }
}

async fn verify(args: VerifyArgs) -> eyre::Result<()> {
    let mut config = KycConfig::from_env().wrap_err("invalid configuration")?;
    if let Some(mode) = args.mode {
        config.fallback_mode = mode;
    }
    let config = Arc::new(config);

    let sheet = load_path(&args.input, config.max_upload_bytes)
        .wrap_err_with(|| format!("failed to load {}", args.input.display()))?;
    let store = Arc::new(JsonLinesOutcomeStore::new(&args.output));
    let orchestrator = BatchOrchestrator::with_provider(config, store)?;

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight rows");
            handle.cancel();
        }
    });

    let report = orchestrator
        .run_batch(
            &sheet,
            BatchOptions {
                batch_id: args.batch_id,
                identifier_kind: args.kind,
            },
            signal,
        )
        .await?;

    info!(output = %args.output.display(), "outcomes written");
    println!("{}", serde_json::to_string_pretty(&report.summary)?);
    Ok(())
}

fn columns(input: &Path, kind: IdentifierKind) -> eyre::Result<()> {
    let sheet = load_path(input, usize::MAX)
        .wrap_err_with(|| format!("failed to load {}", input.display()))?;
    let mut mapping = map_columns(sheet.header_names(), &kind.required_fields());
    mapping.resolve_optional(
        sheet.header_names(),
        &[FieldName::DateOfBirth, FieldName::Reason],
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "headers": sheet.headers,
            "mapping": mapping.mapping,
            "missing": mapping.missing,
        }))?
    );
    if !mapping.is_complete() {
        bail!("sheet cannot be verified as {kind}: required columns are missing");
    }
    Ok(())
}
