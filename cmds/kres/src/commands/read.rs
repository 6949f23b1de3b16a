//! Read command handler.
//!
//! Refreshes the state file from the cluster. Tracked objects that no longer
//! exist are dropped; the rest are replaced by what the cluster reports as
//! last applied.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use kres_model::ResourceId;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{
	session::{ClusterArgs, Session},
	util,
};

#[derive(Args)]
pub struct ReadArgs {
	#[command(flatten)]
	pub cluster: ClusterArgs,
}

/// Run the read command.
pub fn run<W: Write>(args: ReadArgs, writer: W) -> Result<()> {
	util::runtime()?.block_on(run_async(args.cluster, writer))
}

async fn run_async<W: Write>(cluster: ClusterArgs, writer: W) -> Result<()> {
	let cancel = CancellationToken::new();
	util::cancel_on_ctrl_c(cancel.clone());
	let session = cluster.connect(cancel).await?;
	refresh(&session, writer).await?;
	Ok(())
}

/// Refresh every tracked ID. Returns the IDs that were dropped.
#[instrument(skip_all)]
pub async fn refresh<W: Write>(session: &Session, mut writer: W) -> Result<Vec<ResourceId>> {
	let mut state = session.load_state()?;
	let mut dropped = Vec::new();

	for id in state.ids()? {
		let live = session
			.lifecycle
			.read(&id)
			.await
			.with_context(|| format!("reading {id}"))?;

		match live {
			Some(live) => {
				let wait = state.entry(&id).is_some_and(|entry| entry.wait);
				let last_applied = live.last_applied().unwrap_or_else(|| live.stripped());
				state.record(&last_applied, wait);
			}
			None => {
				tracing::info!(id = %id, "no longer exists, dropping from state");
				writeln!(writer, "{id}: gone")?;
				state.remove(&id);
				dropped.push(id);
			}
		}
	}

	session.save_state(&state)?;
	Ok(dropped)
}
