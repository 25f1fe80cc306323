use std::{path::PathBuf, str::FromStr};

use clap::{
	Parser,
	builder::{
		Styles,
		styling::{AnsiColor, Effects},
	},
};

pub const VERSION: &str = concat!(
	env!("CARGO_PKG_VERSION"),
	"-",
	env!("VERGEN_GIT_SHA"),
	"-",
	env!("VERGEN_CARGO_TARGET_TRIPLE"),
);

#[derive(Debug, Parser)]
#[command(version = VERSION, rename_all = "kebab", styles = styles())]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	/// Schedules a sync job at startup. Repeatable.
	#[arg(long = "user", value_name = "ID:EMAIL")]
	pub users: Vec<UserArg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserArg {
	pub user_id: i64,
	pub email: String,
}
impl FromStr for UserArg {
	type Err = String;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		let (id, email) =
			raw.split_once(':').ok_or_else(|| format!("expected ID:EMAIL, got {raw:?}"))?;
		let user_id =
			id.trim().parse::<i64>().map_err(|err| format!("invalid user id {id:?}: {err}"))?;
		let email = email.trim();

		if email.is_empty() {
			return Err("email must be non-empty".to_string());
		}

		Ok(Self { user_id, email: email.to_string() })
	}
}

pub fn styles() -> Styles {
	Styles::styled()
		.header(AnsiColor::Green.on_default() | Effects::BOLD)
		.usage(AnsiColor::Green.on_default() | Effects::BOLD)
		.literal(AnsiColor::Cyan.on_default() | Effects::BOLD)
		.placeholder(AnsiColor::Yellow.on_default())
}
