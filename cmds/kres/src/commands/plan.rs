//! Plan command handler.
//!
//! Shows what `kres apply` would do without writing anything: one unified
//! YAML diff per changed ID and a summary.

use std::{io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use kres_model::{Manifest, ResourceId};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{
	session::{apply_order, load_manifests, pair_renames, ClusterArgs, Session},
	util,
};
use crate::output::{ColorMode, PlanOutput, ResourcePlan};

#[derive(Args)]
pub struct PlanArgs {
	/// Path to the manifests file (JSON object of ID to manifest)
	pub manifests: PathBuf,

	/// Controls color in diff output
	#[arg(long, default_value = "auto", value_enum)]
	pub color: ColorMode,

	#[command(flatten)]
	pub cluster: ClusterArgs,
}

/// Run the plan command.
pub fn run<W: Write>(args: PlanArgs, writer: W) -> Result<()> {
	let manifests = load_manifests(&args.manifests)?;
	util::runtime()?.block_on(run_async(args, manifests, writer))
}

async fn run_async<W: Write>(args: PlanArgs, manifests: Vec<Manifest>, mut writer: W) -> Result<()> {
	let cancel = CancellationToken::new();
	util::cancel_on_ctrl_c(cancel.clone());
	let session = args.cluster.connect(cancel).await?;

	let plans = plan(&session, manifests).await?;

	let mut output = PlanOutput::new(&mut writer, args.color);
	for resource in &plans {
		output.write_plan(resource)?;
	}
	output.write_summary(&plans)?;
	Ok(())
}

/// Classify every desired ID, and every ID only present in state as a
/// deletion. Renames pair up the same way as in `kres apply`.
#[instrument(skip_all, fields(desired = manifests.len()))]
pub async fn plan(session: &Session, mut manifests: Vec<Manifest>) -> Result<Vec<ResourcePlan>> {
	let state = session.load_state()?;
	apply_order(&mut manifests);
	let renames = pair_renames(&manifests, &state.ids()?);
	let mut plans = Vec::with_capacity(manifests.len());

	for desired in &manifests {
		let id = desired.id();
		let last_applied = state.manifest(renames.get(id).unwrap_or(id))?;
		let planned = session
			.lifecycle
			.plan(Some(desired), last_applied.as_ref())
			.await
			.with_context(|| format!("planning {id}"))?;
		let current = planned.live.as_ref().or(last_applied.as_ref());
		plans.push(ResourcePlan::new(
			id.clone(),
			&planned.classification,
			current,
			Some(desired),
		)?);
	}

	let desired_ids: Vec<&ResourceId> = manifests.iter().map(Manifest::id).collect();
	for id in state.ids()? {
		if desired_ids.contains(&&id) || renames.values().any(|renamed| *renamed == id) {
			continue;
		}
		let Some(last_applied) = state.manifest(&id)? else {
			continue;
		};
		let planned = session
			.lifecycle
			.plan(None, Some(&last_applied))
			.await
			.with_context(|| format!("planning {id}"))?;
		let current = planned.live.as_ref().unwrap_or(&last_applied);
		plans.push(ResourcePlan::new(
			id,
			&planned.classification,
			Some(current),
			None,
		)?);
	}

	Ok(plans)
}
