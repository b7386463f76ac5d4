use std::time::Duration;

use {
    clap::Subcommand,
    switchboard_common::now_ms,
    switchboard_config::SwitchboardConfig,
    switchboard_pipeline::Services,
    switchboard_ratelimit::RateDecision,
};

use crate::format_ms;

#[derive(Subcommand)]
pub enum RateAction {
    /// Show counters and the current decision for a destination.
    Show {
        destination: String,
        /// Sending account (defaults to workers.account_id).
        #[arg(long)]
        account: Option<String>,
    },
    /// Clear counters and any block for a destination.
    Reset {
        destination: String,
        #[arg(long)]
        account: Option<String>,
    },
    /// Refuse all replies to a destination for a while.
    Block {
        destination: String,
        #[arg(long, default_value_t = 60)]
        minutes: u64,
        #[arg(long)]
        account: Option<String>,
    },
}

pub async fn handle_rate(config: &SwitchboardConfig, action: RateAction) -> anyhow::Result<()> {
    let services = Services::open_sqlite(config).await?;
    let result = run(config, &services, action).await;
    services.close().await;
    result
}

async fn run(
    config: &SwitchboardConfig,
    services: &Services,
    action: RateAction,
) -> anyhow::Result<()> {
    let limiter = &services.limiter;
    let account = |given: Option<String>| given.unwrap_or_else(|| config.workers.account_id.clone());

    match action {
        RateAction::Show {
            destination,
            account: given,
        } => {
            let account = account(given);
            let limits = limiter.limits();
            let now = now_ms();
            let window = limiter.window(&account, &destination).await?;
            let (hourly, daily, blocked) = window
                .map(|w| (w.hourly_count_at(now), w.daily_count_at(now), w.active_block(now)))
                .unwrap_or_default();

            println!("account:     {account}");
            println!("destination: {destination}");
            println!("this hour:   {hourly}/{}", limits.hourly_max);
            println!("today:       {daily}/{}", limits.daily_max);
            if let Some(until) = blocked {
                println!("blocked:     until {}", format_ms(until));
            }
            match limiter.check(&account, &destination).await {
                RateDecision::Allowed => println!("decision:    allowed"),
                RateDecision::Blocked(reason) => println!("decision:    blocked ({reason})"),
            }
        },
        RateAction::Reset {
            destination,
            account: given,
        } => {
            let account = account(given);
            if limiter.reset(&account, &destination).await? {
                println!("Reset {destination}.");
            } else {
                println!("No counters recorded for {destination}.");
            }
        },
        RateAction::Block {
            destination,
            minutes,
            account: given,
        } => {
            let account = account(given);
            let until = limiter
                .block(&account, &destination, Duration::from_secs(minutes * 60))
                .await?;
            println!("Blocked {destination} until {}.", format_ms(until));
        },
    }
    Ok(())
}
