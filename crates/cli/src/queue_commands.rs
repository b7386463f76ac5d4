use {
    clap::Subcommand,
    switchboard_common::InboundEvent,
    switchboard_config::SwitchboardConfig,
    switchboard_pipeline::Services,
    switchboard_queue::{Job, JobId, JobState},
};

use crate::format_ms;

#[derive(Subcommand)]
pub enum QueueAction {
    /// Show job counts per state.
    Status,
    /// List jobs, newest first.
    List {
        /// pending, active, completed or dead_letter.
        #[arg(long)]
        state: Option<JobState>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List dead-lettered jobs with their last error.
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Give a dead-lettered job a fresh attempt budget.
    Requeue { job_id: String },
    /// Run stall recovery and retention once.
    Sweep,
}

pub async fn handle_queue(config: &SwitchboardConfig, action: QueueAction) -> anyhow::Result<()> {
    let services = Services::open_sqlite(config).await?;
    let result = run(&services, action).await;
    services.close().await;
    result
}

async fn run(services: &Services, action: QueueAction) -> anyhow::Result<()> {
    let queue = &services.queue;
    match action {
        QueueAction::Status => {
            let counts = queue.counts().await?;
            println!("pending:     {}", counts.pending);
            println!("active:      {}", counts.active);
            println!("completed:   {}", counts.completed);
            println!("dead_letter: {}", counts.dead_letter);
        },
        QueueAction::List { state, limit } => {
            let jobs = queue.list(state, limit).await?;
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in &jobs {
                println!("{}", describe(job));
            }
        },
        QueueAction::DeadLetters { limit } => {
            let jobs = queue.dead_letters(limit).await?;
            if jobs.is_empty() {
                println!("No dead-lettered jobs.");
            }
            for job in &jobs {
                println!("{}", describe(job));
                println!(
                    "    error: {}",
                    job.last_error.as_deref().unwrap_or("(none)")
                );
            }
        },
        QueueAction::Requeue { job_id } => {
            if queue.requeue_dead_letter(&JobId::from(job_id.clone())).await? {
                println!("Requeued {job_id}.");
            } else {
                anyhow::bail!("{job_id} is not a dead-lettered job");
            }
        },
        QueueAction::Sweep => {
            let sweep = queue.reap_stalled().await?;
            let purged = queue.purge().await?;
            println!(
                "Requeued {} stalled, dead-lettered {}, purged {purged}.",
                sweep.requeued, sweep.dead_lettered
            );
        },
    }
    Ok(())
}

fn describe(job: &Job) -> String {
    let sender = job
        .decode::<InboundEvent>()
        .map(|event| event.sender())
        .unwrap_or_else(|_| "?".into());
    let at = job.finished_at_ms.unwrap_or(job.enqueued_at_ms);
    format!(
        "{}  {:<11}  attempts {}/{}  sender {sender}  {}",
        job.id,
        job.state.as_str(),
        job.attempts_made,
        job.max_attempts,
        format_ms(at)
    )
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_shows_sender_and_state() {
        let event = InboundEvent::text("msg-1", "5511987654321@s.whatsapp.net", "oi");
        let job = Job::new(
            JobId::from_external_id("msg-1"),
            serde_json::to_value(&event).unwrap(),
            3,
            0,
        );
        let line = describe(&job);
        assert!(line.contains("pending"));
        assert!(line.contains("sender 5511987654321"));
        assert!(line.contains("attempts 0/3"));
    }
}
