use {anyhow::Result, clap::Subcommand};

use chatrelay_dispatch::{DispatchQueue, Job, JobFilter, JobState, RetentionPolicy};

#[derive(Subcommand)]
pub enum JobsAction {
    /// List jobs, newest first.
    List {
        /// queued, in_flight, requeued, completed or failed.
        #[arg(long)]
        state: Option<JobState>,
        #[arg(long)]
        account: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print one job as JSON.
    Show { id: String },
    /// List dead-lettered jobs.
    Dead {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Requeue a dead-lettered job with a fresh attempt budget.
    Retry { id: String },
    /// Evict finished jobs past their retention now.
    Purge,
}

pub async fn handle_jobs(
    action: JobsAction,
    queue: &DispatchQueue,
    retention: &RetentionPolicy,
) -> Result<()> {
    match action {
        JobsAction::List {
            state,
            account,
            limit,
        } => {
            let filter = JobFilter {
                state,
                account_id: account,
            };
            print_table(&queue.list(&filter, limit).await?);
        },
        JobsAction::Show { id } => {
            let job = queue.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        },
        JobsAction::Dead { limit } => {
            let jobs = queue.dead_letters(limit).await?;
            print_table(&jobs);
            for job in &jobs {
                if let Some(ref failure) = job.last_failure {
                    println!("  {}: {}", job.id, failure.reason);
                }
            }
        },
        JobsAction::Retry { id } => {
            let job = queue.retry_dead(&id).await?;
            println!("Requeued {}", job.id);
        },
        JobsAction::Purge => {
            let purged = queue.purge(retention).await?;
            println!("Purged {purged} job(s)");
        },
    }
    Ok(())
}

fn print_table(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }
    println!(
        "{:<36}  {:<10}  {:<6}  {:>7}  {:>8}  {:<16}  RECIPIENT",
        "ID", "STATE", "KIND", "ATTEMPT", "PROGRESS", "ACCOUNT"
    );
    for job in jobs {
        println!(
            "{:<36}  {:<10}  {:<6}  {:>7}  {:>7}%  {:<16}  {}",
            job.id,
            job.state.as_str(),
            job.kind(),
            job.attempt,
            job.progress,
            job.account_id,
            job.recipient_id
        );
    }
}
