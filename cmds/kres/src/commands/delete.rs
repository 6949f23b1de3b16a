//! Delete command handler.

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
pub struct DeleteArgs {
	/// ID of the resource, e.g. apps/Deployment/default/example
	pub id: String,

	#[command(flatten)]
	pub cluster: ClusterArgs,
}

/// Run the delete command.
pub fn run<W: Write>(args: DeleteArgs, writer: W) -> Result<()> {
	let id = ResourceId::decode(&args.id)?;
	util::runtime()?.block_on(run_async(args.cluster, id, writer))
}

async fn run_async<W: Write>(cluster: ClusterArgs, id: ResourceId, writer: W) -> Result<()> {
	let cancel = CancellationToken::new();
	util::cancel_on_ctrl_c(cancel.clone());
	let session = cluster.connect(cancel).await?;
	delete(&session, &id, writer).await?;
	Ok(())
}

/// Delete one resource and drop it from state.
///
/// Uses the tracked manifest when the ID is in state, so its recorded API
/// version is honored. Returns whether a deletion was issued.
#[instrument(skip_all, fields(id = %id))]
pub async fn delete<W: Write>(session: &Session, id: &ResourceId, mut writer: W) -> Result<bool> {
	let mut state = session.load_state()?;

	let deleted = match state.manifest(id)? {
		Some(last_applied) => {
			let wait = session.wait_for_entry(state.entry(id).is_some_and(|entry| entry.wait));
			session.lifecycle.delete(&last_applied, &wait).await
		}
		None => session.lifecycle.delete_id(id, &session.wait()).await,
	}
	.with_context(|| format!("deleting {id}"))?;

	if state.remove(id).is_some() {
		session.save_state(&state)?;
	}

	if deleted {
		writeln!(writer, "{id}: deleted")?;
	} else {
		writeln!(writer, "{id}: not found")?;
	}
	Ok(deleted)
}
