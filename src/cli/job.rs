//! CLI commands: `vesper job status` and `vesper job cancel`

use anyhow::Result;
use vesper_client::{Error, JobReport, JobStatusSource};

use super::Session;

/// Print the current status of a job.
pub async fn status(job_id: &str) -> Result<()> {
    let session = Session::connect()?;
    let result = session.client.api().job_status(job_id).await;
    session.finish().await;

    let report = result?;
    print_report(&report);
    Ok(())
}

/// Cancel a job.
pub async fn cancel(job_id: &str) -> Result<()> {
    let session = Session::connect()?;
    let result = session.client.cancel_job(job_id).await;
    session.finish().await;

    match result {
        Ok(reply) => {
            if reply.message.is_empty() {
                println!("  job {} cancelled", job_id);
            } else {
                println!("  job {} cancelled: {}", job_id, reply.message);
            }
            Ok(())
        }
        Err(e @ Error::CancelRejected { .. }) => {
            println!("{}", e.user_message());
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &JobReport) {
    println!();
    println!("  Job {}", report.job_id);
    println!("  {}", "-".repeat(40));
    println!("  {:<16} {}", "Status", report.status.as_str());
    if let Some(progress) = report.progress {
        println!("  {:<16} {}%", "Progress", progress);
    }
    if let Some(position) = report.queue_position {
        println!("  {:<16} {}", "Queue position", position);
    }
    if let Some(message_id) = &report.message_id {
        println!("  {:<16} {}", "Message", message_id);
    }
    if let Some(url) = &report.image_url {
        println!("  {:<16} {}", "Image", url);
    }
    if let Some(error) = &report.error {
        println!("  {:<16} {}", "Error", error);
    }
    println!();
}
