use std::env;

use chrono::Utc;
use logoflow::config::Config;
use logoflow::db;
use logoflow::jobs::{Job, JobLedger, JobsRepo};
use logoflow::storage::{BlobStore, S3BlobStore};
use uuid::Uuid;

const USAGE: &str = "logoflowctl <command>\n\
     Commands:\n\
     - job <job_id>\n\
     - counts\n\
     - stuck <minutes>\n\
     - delete-blob <key>\n\
     \n\
     Reads the same environment as logoflowd.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let cfg = Config::from_env()?;
    let pool = db::make_pool(&cfg.database_url, &cfg.pool).await?;
    let repo = JobsRepo::new(pool);

    match command.as_str() {
        "job" => {
            let id: Uuid = arg(&args, 2, "usage: logoflowctl job <job_id>")?.parse()?;
            match repo.get_job(id).await? {
                Some(job) => print_job(&job),
                None => {
                    eprintln!("job {id} not found");
                    std::process::exit(1);
                }
            }
        }
        "counts" => {
            let counts = repo.status_counts().await?;
            if counts.is_empty() {
                println!("no jobs");
            }
            for (status, n) in counts {
                println!("{status:<11} {n}");
            }
        }
        "stuck" => {
            let minutes: i64 = arg(&args, 2, "usage: logoflowctl stuck <minutes>")?.parse()?;
            let cutoff = Utc::now() - chrono::Duration::minutes(minutes.max(1));
            let jobs = repo.list_stuck(cutoff, 100).await?;

            println!("{} job(s) not settled since {cutoff}", jobs.len());
            for job in &jobs {
                println!(
                    "- {} status={} updated_at={} key={}",
                    job.id, job.status, job.updated_at, job.source_key
                );
            }
        }
        "delete-blob" => {
            let key = arg(&args, 2, "usage: logoflowctl delete-blob <key>")?;

            let refs = repo.find_by_source_key(key).await?;
            if !refs.is_empty() {
                let ids: Vec<String> = refs.iter().map(|j| j.id.to_string()).collect();
                anyhow::bail!("refusing to delete {key}: referenced by job(s) {}", ids.join(", "));
            }

            let store = S3BlobStore::new(&cfg.storage);
            store.delete(key).await?;
            println!("deleted {key}");
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn arg<'a>(args: &'a [String], idx: usize, usage: &str) -> anyhow::Result<&'a str> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("{usage}"))
}

fn print_job(job: &Job) {
    println!("id:           {}", job.id);
    println!("status:       {}", job.status);
    println!("s3_key:       {}", job.source_key);
    println!("created_at:   {}", job.created_at);
    println!("updated_at:   {}", job.updated_at);
    if let Some(done) = job.completed_at {
        println!("completed_at: {done}");
    }
    if let Some(url) = &job.result_url {
        println!("result_url:   {url}");
        println!("logos_found:  {}", job.logos.len());
        for logo in &job.logos {
            let b = logo.bounding_box;
            println!(
                "  - {} conf={:.2} box=({}, {}, {}x{})",
                logo.logo_type, logo.confidence, b.x, b.y, b.width, b.height
            );
        }
    }
    if let Some(err) = &job.error_message {
        println!("error:        {err}");
    }
}
