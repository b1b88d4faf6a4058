// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Operator CLI for the key management core.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use loom_server_kms::db::run_migrations;
use loom_server_kms::{
	load_settings, BulkReencryptor, ConnectionRole, DbConnections, KmsService, KmsSettings, ReencryptionOptions,
	ReencryptionPlan, ResumeMode, RootKeyHandle, RootKeyInputs, RootKeyProvider, SqliteKmsStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// loom-kms - root key checks and bulk re-encryption.
#[derive(Parser, Debug)]
#[command(name = "loom-kms", about = "Loom key management maintenance", version)]
struct Args {
	/// TOML settings file; environment variables override it
	#[arg(long, env = "LOOM_KMS_CONFIG")]
	config: Option<PathBuf>,

	/// Emit logs as JSON
	#[arg(long)]
	json_logs: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Resolve the root key and record its strategy on first use
	Check,
	/// Apply or revert a re-encryption plan
	Migrate {
		#[command(subcommand)]
		direction: Direction,
	},
	/// Show how many rows of a plan's table are migrated
	Status {
		#[arg(long)]
		plan: PathBuf,
	},
}

#[derive(Subcommand, Debug)]
enum Direction {
	/// Re-encrypt legacy rows into tenant envelopes
	Up {
		#[arg(long)]
		plan: PathBuf,
		/// Rewrite envelopes for rows that already have them
		#[arg(long)]
		recompute: bool,
		/// Stream candidate rows from the read replica
		#[arg(long)]
		from_replica: bool,
	},
	/// Drop envelope columns, restoring legacy columns if they are gone
	Down {
		#[arg(long)]
		plan: PathBuf,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	dotenvy::dotenv().ok();
	init_tracing(args.json_logs);

	let settings = load_settings(args.config.as_deref()).context("failed to load settings")?;
	let connections = DbConnections::connect(&settings.database).await?;
	run_migrations(connections.primary()).await?;
	let store = Arc::new(SqliteKmsStore::new(connections.clone()));

	let root = resolve_root(store.as_ref()).await?;
	let kms = Arc::new(KmsService::new(root, store));

	match args.command {
		Command::Check => {
			println!("root key strategy: {}", kms.strategy());
		}
		Command::Status { plan } => {
			let plan = ReencryptionPlan::from_toml_file(&plan)?;
			let status = build_reencryptor(&kms, &connections, settings_options(&settings))
				.status(&plan)
				.await?;
			println!("plan:               {}", status.plan);
			println!("rows:               {}", status.total_rows);
			println!("pending:            {}", status.pending_rows);
			println!("envelope columns:   {}", status.envelope_columns_present);
			println!("legacy columns:     {}", status.legacy_columns_present);
			println!("tightened:          {}", status.tightened);
		}
		Command::Migrate { direction } => match direction {
			Direction::Up {
				plan,
				recompute,
				from_replica,
			} => {
				let plan = ReencryptionPlan::from_toml_file(&plan)?;
				let options = ReencryptionOptions {
					mode: if recompute {
						ResumeMode::Recompute
					} else {
						ResumeMode::SkipMigrated
					},
					read_role: if from_replica {
						ConnectionRole::Replica
					} else {
						ConnectionRole::Primary
					},
					..settings_options(&settings)
				};
				let reencryptor = build_reencryptor(&kms, &connections, options);
				cancel_on_interrupt(&reencryptor);

				let report = reencryptor.run(&plan).await?;
				println!(
					"{}: {} rows in {} batches, phase {}, cache hit rate {:.2}",
					report.plan,
					report.rows_migrated,
					report.batches_written,
					report.phase,
					report.cache.hit_rate()
				);
			}
			Direction::Down { plan } => {
				let plan = ReencryptionPlan::from_toml_file(&plan)?;
				let reencryptor = build_reencryptor(&kms, &connections, settings_options(&settings));
				cancel_on_interrupt(&reencryptor);

				let report = reencryptor.rollback(&plan).await?;
				println!(
					"{}: {:?}, {} rows restored",
					report.plan, report.mode, report.rows_restored
				);
			}
		},
	}

	Ok(())
}

fn init_tracing(json: bool) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
	let registry = tracing_subscriber::registry().with(filter);
	if json {
		registry
			.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
			.init();
	} else {
		registry
			.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
			.init();
	}
}

/// Resolve the root key from the environment. There is no HSM adapter in
/// this binary, so an HSM strategy fails here with a configuration error.
async fn resolve_root(store: &SqliteKmsStore) -> anyhow::Result<RootKeyHandle> {
	let inputs = RootKeyInputs::from_env()?;
	match RootKeyProvider::bootstrap(inputs, store, None).await {
		Ok(root) => Ok(root),
		Err(e) if e.is_startup_fatal() => {
			tracing::error!(error = %e, "root key validation failed");
			Err(e).context("refusing to continue without a usable root key")
		}
		Err(e) => Err(e.into()),
	}
}

fn settings_options(settings: &KmsSettings) -> ReencryptionOptions {
	ReencryptionOptions::from(&settings.migration)
}

fn build_reencryptor(
	kms: &Arc<KmsService<SqliteKmsStore>>,
	connections: &DbConnections,
	options: ReencryptionOptions,
) -> BulkReencryptor<SqliteKmsStore> {
	BulkReencryptor::new(Arc::clone(kms), connections.clone()).with_options(options)
}

fn cancel_on_interrupt(reencryptor: &BulkReencryptor<SqliteKmsStore>) {
	let token = reencryptor.cancellation_token();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			tracing::warn!("interrupt received, stopping after the current batch");
			token.cancel();
		}
	});
}
