//! `taskflow consumer put/remove/list`.

use crate::ConsumerCommands;

pub async fn run(broker_url: &str, command: ConsumerCommands) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let url = format!("{}/consumer", broker_url.trim_end_matches('/'));

    match command {
        ConsumerCommands::Put { topic, endpoint_url, health_url } => {
            let body = serde_json::json!({
                "topic": topic,
                "endpoint_url": endpoint_url,
                "health_url": health_url,
            });
            let consumer: serde_json::Value = http.put(&url).json(&body).send().await?.json().await?;
            println!("{}", serde_json::to_string_pretty(&consumer)?);
        }
        ConsumerCommands::Remove { topic, endpoint_url } => {
            let body = serde_json::json!({ "topic": topic, "endpoint_url": endpoint_url });
            let response = http.delete(&url).json(&body).send().await?;
            if response.status().is_success() {
                println!("removed");
            } else {
                anyhow::bail!("broker rejected removal: {}", response.status());
            }
        }
        ConsumerCommands::List => {
            let consumers: serde_json::Value = http.get(&url).send().await?.json().await?;
            println!("{}", serde_json::to_string_pretty(&consumers)?);
        }
    }

    Ok(())
}
