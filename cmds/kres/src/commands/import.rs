//! Import command handler.
//!
//! Adopts an existing cluster object: rebuilds its last-applied manifest,
//! prints it as YAML and starts tracking it in state.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use kres_model::Manifest;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{
	session::{ClusterArgs, Session},
	util,
};

#[derive(Args)]
pub struct ImportArgs {
	/// ID of the resource, e.g. _/Namespace/_/example
	pub id: String,

	#[command(flatten)]
	pub cluster: ClusterArgs,
}

/// Run the import command.
pub fn run<W: Write>(args: ImportArgs, writer: W) -> Result<()> {
	util::runtime()?.block_on(run_async(args, writer))
}

async fn run_async<W: Write>(args: ImportArgs, writer: W) -> Result<()> {
	let cancel = CancellationToken::new();
	util::cancel_on_ctrl_c(cancel.clone());
	let session = args.cluster.connect(cancel).await?;
	import(&session, &args.id, writer).await?;
	Ok(())
}

/// Import `id` into state and write the reconstructed manifest to `writer`.
#[instrument(skip_all, fields(id = %id))]
pub async fn import<W: Write>(session: &Session, id: &str, mut writer: W) -> Result<Manifest> {
	let manifest = session.lifecycle.import(id).await?;

	let mut state = session.load_state()?;
	state.record(&manifest, session.wait().wait);
	session.save_state(&state)?;

	let yaml = serde_yaml::to_string(&manifest.canonical())
		.with_context(|| format!("rendering {} as YAML", manifest.id()))?;
	write!(writer, "{yaml}")?;
	Ok(manifest)
}
