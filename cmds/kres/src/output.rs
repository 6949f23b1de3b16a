//! Plan output formatting.
//!
//! Writes one unified YAML diff per changed resource, colored per line
//! (red for removals, green for additions), and a summary grouped by change
//! kind.

use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use kres_model::{ChangeKind, Classification, Manifest, ResourceId};
use nu_ansi_term::{Color, Style};
use similar::TextDiff;
use thiserror::Error;
use tracing::instrument;

/// Errors that can occur during plan output.
#[derive(Debug, Error)]
pub enum OutputError {
	#[error("writing plan output")]
	Write(#[from] std::io::Error),

	#[error("rendering {id} as YAML")]
	Yaml {
		id: ResourceId,
		#[source]
		source: serde_yaml::Error,
	},
}

/// When to emit ANSI colors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
	/// Color when stdout is a terminal and NO_COLOR is unset
	#[default]
	Auto,
	Always,
	Never,
}

impl ColorMode {
	pub fn should_colorize(self) -> bool {
		match self {
			Self::Auto => std::env::var_os("NO_COLOR").is_none() && std::io::stdout().is_terminal(),
			Self::Always => true,
			Self::Never => false,
		}
	}
}

fn kind_color(kind: ChangeKind) -> Color {
	match kind {
		ChangeKind::Create => Color::Green,
		ChangeKind::UpdateInPlace => Color::Yellow,
		ChangeKind::Recreate => Color::Purple,
		ChangeKind::Delete => Color::Red,
		ChangeKind::NoOp => Color::Default,
	}
}

/// The planned change for one resource, rendered as YAML on both sides.
#[derive(Debug, Clone)]
pub struct ResourcePlan {
	pub id: ResourceId,
	pub kind: ChangeKind,
	pub reason: Option<String>,
	pub current_yaml: String,
	pub desired_yaml: String,
}

fn to_yaml(manifest: Option<&Manifest>) -> Result<String, OutputError> {
	let Some(manifest) = manifest else {
		return Ok(String::new());
	};
	serde_yaml::to_string(&manifest.stripped().canonical()).map_err(|source| OutputError::Yaml {
		id: manifest.id().clone(),
		source,
	})
}

impl ResourcePlan {
	pub fn new(
		id: ResourceId,
		classification: &Classification,
		current: Option<&Manifest>,
		desired: Option<&Manifest>,
	) -> Result<Self, OutputError> {
		Ok(Self {
			id,
			kind: classification.kind,
			reason: classification.reason.as_ref().map(ToString::to_string),
			current_yaml: to_yaml(current)?,
			desired_yaml: to_yaml(desired)?,
		})
	}

	pub fn has_changes(&self) -> bool {
		self.kind != ChangeKind::NoOp
	}

	/// Unified diff from the current to the desired YAML.
	pub fn unified_diff(&self) -> String {
		let name = self.id.encode();
		let (old_header, new_header) = match self.kind {
			ChangeKind::Create => ("/dev/null".to_string(), format!("b/{name}")),
			ChangeKind::Delete => (format!("a/{name}"), "/dev/null".to_string()),
			_ => (format!("a/{name}"), format!("b/{name}")),
		};

		TextDiff::from_lines(&self.current_yaml, &self.desired_yaml)
			.unified_diff()
			.context_radius(3)
			.header(&old_header, &new_header)
			.to_string()
	}
}

/// Handles plan output formatting with optional color.
pub struct PlanOutput<W: Write> {
	writer: W,
	use_color: bool,
}

impl<W: Write> PlanOutput<W> {
	pub fn new(writer: W, color_mode: ColorMode) -> Self {
		Self {
			writer,
			use_color: color_mode.should_colorize(),
		}
	}

	/// Write the header and diff of a single resource. No-ops print nothing.
	#[instrument(skip_all, fields(id = %plan.id))]
	pub fn write_plan(&mut self, plan: &ResourcePlan) -> Result<(), OutputError> {
		if !plan.has_changes() {
			return Ok(());
		}

		let header = format!("{}: {}", plan.id, plan.kind);
		if self.use_color {
			writeln!(
				self.writer,
				"{}",
				Style::new().bold().fg(kind_color(plan.kind)).paint(header)
			)?;
		} else {
			writeln!(self.writer, "{header}")?;
		}
		if let Some(reason) = &plan.reason {
			writeln!(self.writer, "  reason: {reason}")?;
		}

		self.write_diff(&plan.unified_diff())
	}

	fn write_diff(&mut self, diff: &str) -> Result<(), OutputError> {
		if !self.use_color {
			write!(self.writer, "{diff}")?;
			return Ok(());
		}

		for line in diff.lines() {
			let style = if line.starts_with("+++") || line.starts_with("---") {
				Style::new().bold()
			} else if line.starts_with('+') {
				Style::new().fg(Color::Green)
			} else if line.starts_with('-') {
				Style::new().fg(Color::Red)
			} else if line.starts_with("@@") {
				Style::new().fg(Color::Cyan)
			} else {
				Style::new()
			};
			writeln!(self.writer, "{}", style.paint(line))?;
		}
		Ok(())
	}

	/// Write resource IDs grouped by change kind, then the total.
	#[instrument(skip_all, fields(plan_count = plans.len()))]
	pub fn write_summary(&mut self, plans: &[ResourcePlan]) -> Result<(), OutputError> {
		let sections = [
			("Create", ChangeKind::Create),
			("Update in-place", ChangeKind::UpdateInPlace),
			("Recreate", ChangeKind::Recreate),
			("Delete", ChangeKind::Delete),
		];

		let mut total = 0;
		for (title, kind) in sections {
			let ids: Vec<String> = plans
				.iter()
				.filter(|plan| plan.kind == kind)
				.map(|plan| plan.id.encode())
				.collect();
			if !ids.is_empty() {
				total += ids.len();
				self.write_section(title, &ids, kind_color(kind))?;
			}
		}

		writeln!(self.writer)?;
		let line = format!("Total: {total} resource(s) with changes");
		if self.use_color {
			writeln!(self.writer, "{}", Style::new().bold().paint(line))?;
		} else {
			writeln!(self.writer, "{line}")?;
		}
		Ok(())
	}

	fn write_section(&mut self, title: &str, items: &[String], color: Color) -> Result<(), OutputError> {
		if self.use_color {
			writeln!(
				self.writer,
				"\n{}",
				Style::new().bold().fg(color).paint(format!("{title}:"))
			)?;
		} else {
			writeln!(self.writer, "\n{title}:")?;
		}

		for item in items {
			if self.use_color {
				writeln!(self.writer, "  {}", Style::new().fg(color).paint(item))?;
			} else {
				writeln!(self.writer, "  {item}")?;
			}
		}
		Ok(())
	}
}
