use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use client_core::{
    config::load_settings, ClientContext, EntryForm, FailureReason, MutationOutcome,
    MutationRequest, TaxForm, TracingNotifier,
};
use shared::domain::{EntryId, TaxId};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Record income, expenses and taxes against the hosted backend")]
struct Cli {
    #[arg(long, env = "APP__EMAIL", global = true)]
    email: Option<String>,
    #[arg(long, env = "APP__PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a new account with the given credentials.
    SignUp,
    #[command(flatten)]
    Account(AccountCommand),
}

/// Commands that run against a signed-in session.
#[derive(Subcommand, Debug)]
enum AccountCommand {
    /// Show the signed-in user.
    Whoami,
    AddEntry(EntryArgs),
    EditEntry {
        #[arg(long)]
        id: i64,
        #[command(flatten)]
        fields: EntryArgs,
    },
    AddTax(TaxArgs),
    EditTax {
        #[arg(long)]
        id: i64,
        #[command(flatten)]
        fields: TaxArgs,
    },
    ListEntries,
    ListTaxes,
    /// Sign in, then revoke the session.
    SignOut,
}

#[derive(Args, Debug)]
struct EntryArgs {
    #[arg(long)]
    description: String,
    #[arg(long)]
    amount: String,
    /// YYYY-MM-DD
    #[arg(long)]
    date: String,
    /// income or expense
    #[arg(long = "type")]
    kind: String,
    #[arg(long)]
    category: String,
}

impl From<EntryArgs> for EntryForm {
    fn from(args: EntryArgs) -> Self {
        Self {
            description: args.description,
            amount: args.amount,
            date: args.date,
            kind: args.kind,
            category: args.category,
        }
    }
}

#[derive(Args, Debug)]
struct TaxArgs {
    #[arg(long = "type")]
    kind: String,
    #[arg(long)]
    amount: String,
    /// YYYY-MM
    #[arg(long)]
    period: String,
    #[arg(long)]
    entry_id: String,
}

impl From<TaxArgs> for TaxForm {
    fn from(args: TaxArgs) -> Self {
        Self {
            kind: args.kind,
            amount: args.amount,
            period: args.period,
            entry_id: args.entry_id,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let settings = load_settings();
    let ctx = ClientContext::connect(&settings, Arc::new(TracingNotifier))?;
    let result = run(&ctx, cli).await;
    ctx.shutdown();
    result
}

async fn run(ctx: &ClientContext, cli: Cli) -> Result<()> {
    let email = cli.email.context("--email or APP__EMAIL is required")?;
    let password = cli.password.context("--password or APP__PASSWORD is required")?;

    ctx.session.ready().await;
    let command = match cli.command {
        Command::SignUp => return sign_up(ctx, &email, &password).await,
        Command::Account(command) => command,
    };
    ctx.session.sign_in(&email, &password).await?;
    let user = ctx.session.require_user()?;
    info!(user_id = %user.id, ?command, "running command");

    match command {
        AccountCommand::Whoami => {
            println!(
                "user_id={} email={}",
                user.id,
                user.email.as_deref().unwrap_or("-")
            );
        }
        AccountCommand::AddEntry(fields) => {
            let outcome = ctx
                .entries()
                .submit(MutationRequest::create(EntryForm::from(fields)))
                .await;
            report(outcome)?;
        }
        AccountCommand::EditEntry { id, fields } => {
            let outcome = ctx
                .entries()
                .submit(MutationRequest::update(EntryForm::from(fields), EntryId(id)))
                .await;
            report(outcome)?;
        }
        AccountCommand::AddTax(fields) => {
            let outcome = ctx
                .taxes()
                .submit(MutationRequest::create(TaxForm::from(fields)))
                .await;
            report(outcome)?;
        }
        AccountCommand::EditTax { id, fields } => {
            let outcome = ctx
                .taxes()
                .submit(MutationRequest::update(TaxForm::from(fields), TaxId(id)))
                .await;
            report(outcome)?;
        }
        AccountCommand::ListEntries => {
            let entries = ctx.list_entries().await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        AccountCommand::ListTaxes => {
            let taxes = ctx.list_taxes().await?;
            println!("{}", serde_json::to_string_pretty(&taxes)?);
        }
        AccountCommand::SignOut => {
            ctx.session.sign_out().await?;
            println!("signed out {}", user.id);
        }
    }
    Ok(())
}

async fn sign_up(ctx: &ClientContext, email: &str, password: &str) -> Result<()> {
    match ctx.session.sign_up(email, password).await? {
        Some(session) => println!("signed up and signed in as {}", session.user.id),
        None => println!("check {email} for a confirmation link"),
    }
    Ok(())
}

fn report(outcome: MutationOutcome) -> Result<()> {
    match outcome {
        MutationOutcome::Success => {
            println!("saved");
            Ok(())
        }
        MutationOutcome::Failure {
            reason: FailureReason::Validation(errors),
        } => {
            warn!(fields = errors.len(), "input rejected");
            for (field, message) in errors.iter() {
                eprintln!("{field}: {message}");
            }
            bail!("input rejected")
        }
        MutationOutcome::Failure {
            reason: FailureReason::Persistence(message),
        } => bail!("save failed: {message}"),
    }
}
