//! `taskflow task create/get/status/list`.

use taskflow_core::client::{BrokerClient, CreateTaskRequest};

use crate::TaskCommands;

pub async fn run(broker_url: &str, command: TaskCommands) -> anyhow::Result<()> {
    let client = BrokerClient::new(reqwest::Client::new(), broker_url);

    match command {
        TaskCommands::Create { name, input, parent_id, idempotency_key } => {
            let input = serde_json::from_str(&input)?;
            let task = client
                .create_task(&CreateTaskRequest {
                    name,
                    input,
                    parent_id,
                    scheduled_start_at: None,
                    idempotency_key,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::Get { id } => {
            let task = client.get_task(id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::Status { id } => {
            let status = client.get_status(id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        TaskCommands::List { name, status_code } => {
            list_tasks(broker_url, name, status_code).await?;
        }
    }

    Ok(())
}

/// `BrokerClient` has no list endpoint (only the CLI needs it), so go
/// straight to `GET /task` here.
async fn list_tasks(broker_url: &str, name: Option<String>, status_code: Option<u8>) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let mut url = reqwest::Url::parse(&format!("{}/task", broker_url.trim_end_matches('/')))?;
    {
        let mut pairs = url.query_pairs_mut();
        if let Some(name) = &name {
            pairs.append_pair("name", name);
        }
        if let Some(code) = status_code {
            pairs.append_pair("status_code", &code.to_string());
        }
    }
    let body: serde_json::Value = http.get(url).send().await?.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
