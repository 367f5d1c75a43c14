// SPDX-License-Identifier: Apache-2.0

#![warn(clippy::pedantic)]
#![allow(clippy::unreadable_literal)]

use clap::Parser;
use quorand::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    Cli::parse().run().await
}
