//! Apply command handler.
//!
//! Reconciles a manifests file against the state file: every desired ID is
//! created or updated, then IDs that only remain in state are deleted. State
//! is saved after each successful step so an interrupted run resumes cleanly.
//!
//! A renamed resource shows up as a new ID plus a stale one. When a group and
//! kind has exactly one of each, the pair is treated as a rename and the old
//! object is deleted before the new one is created. Otherwise new IDs are
//! created first and stale IDs deleted afterwards.

use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use kres_model::{ChangeKind, Manifest, ResourceId};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{
	session::{apply_order, load_manifests, pair_renames, ClusterArgs, Session},
	util,
};

#[derive(Args)]
pub struct ApplyArgs {
	/// Path to the manifests file (JSON object of ID to manifest)
	pub manifests: PathBuf,

	#[command(flatten)]
	pub cluster: ClusterArgs,
}

/// Outcome of one reconcile run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
	/// IDs written, with the operation carried out.
	pub applied: Vec<(ResourceId, ChangeKind)>,
	/// IDs that were removed from state.
	pub deleted: Vec<ResourceId>,
}

/// Run the apply command.
pub fn run<W: Write>(args: ApplyArgs, writer: W) -> Result<()> {
	let manifests = load_manifests(&args.manifests)?;
	util::runtime()?.block_on(run_async(args.cluster, manifests, writer))
}

async fn run_async<W: Write>(cluster: ClusterArgs, manifests: Vec<Manifest>, writer: W) -> Result<()> {
	let cancel = CancellationToken::new();
	util::cancel_on_ctrl_c(cancel.clone());
	let session = cluster.connect(cancel).await?;
	reconcile(&session, manifests, writer).await?;
	Ok(())
}

/// Converge the cluster to `manifests`, tracking progress in the session's
/// state file.
#[instrument(skip_all, fields(desired = manifests.len()))]
pub async fn reconcile<W: Write>(
	session: &Session,
	mut manifests: Vec<Manifest>,
	mut writer: W,
) -> Result<ReconcileReport> {
	let mut state = session.load_state()?;
	let mut report = ReconcileReport::default();
	apply_order(&mut manifests);
	let renames = pair_renames(&manifests, &state.ids()?);

	for desired in &manifests {
		let id = desired.id();
		let previous_id = renames.get(id).unwrap_or(id);
		let last_applied = state.manifest(previous_id)?;
		let wait = session.wait();

		let applied = session
			.lifecycle
			.apply(desired, last_applied.as_ref(), &wait)
			.await
			.with_context(|| format!("applying {id}"))?;

		if previous_id != id {
			state.remove(previous_id);
		}
		state.record(desired, wait.wait);
		session.save_state(&state)?;

		if applied.kind != ChangeKind::NoOp {
			writeln!(writer, "{id}: {}", applied.kind)?;
		}
		report.applied.push((id.clone(), applied.kind));
	}

	let desired_ids: Vec<&ResourceId> = manifests.iter().map(Manifest::id).collect();
	let mut stale: Vec<ResourceId> = state
		.ids()?
		.into_iter()
		.filter(|id| !desired_ids.contains(&id))
		.rev()
		.collect();
	// namespaces and CRDs go last, after everything living in them
	stale.sort_by_key(ResourceId::is_foundational);

	for id in stale {
		let Some(last_applied) = state.manifest(&id)? else {
			continue;
		};
		let wait = session.wait_for_entry(state.entry(&id).is_some_and(|entry| entry.wait));

		let deleted = session
			.lifecycle
			.delete(&last_applied, &wait)
			.await
			.with_context(|| format!("deleting {id}"))?;

		state.remove(&id);
		session.save_state(&state)?;

		if deleted {
			writeln!(writer, "{id}: {}", ChangeKind::Delete)?;
		} else {
			tracing::debug!(id = %id, "already gone, dropped from state");
		}
		report.deleted.push(id);
	}

	tracing::info!(
		applied = report.applied.len(),
		deleted = report.deleted.len(),
		"reconcile finished"
	);
	Ok(report)
}
