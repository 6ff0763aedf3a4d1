// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::Context;
use chrono::SecondsFormat;
use serde_json::{Value, json};
use syncengine::{DeadLetter, DeadLetterId, MutationRecord, Payload, QueueStore};

use crate::args::Command;

pub async fn run_command(queue: &QueueStore, command: Command, json: bool) -> anyhow::Result<()> {
    match command {
        Command::Status => {
            let snapshot = queue.observer().snapshot();
            if json {
                print_json(&json!({
                    "pending": snapshot.pending_count(),
                    "dead_letters": snapshot.dead_letter_count(),
                }))?;
            } else {
                println!("Pending mutations: {}", snapshot.pending_count());
                println!("Dead letters: {}", snapshot.dead_letter_count());
            }
        }
        Command::Pending => {
            let records = queue.list_pending().await;
            if json {
                print_json(&Value::Array(records.iter().map(record_json).collect()))?;
            } else {
                for record in &records {
                    println!(
                        "{:>6}  {:<20} {:<6} v{} retries={}{}",
                        record.position(),
                        record.key().to_string(),
                        record.action(),
                        record.version(),
                        record.retry_count(),
                        record
                            .next_attempt_at()
                            .map(|at| format!(" next={}", at.to_rfc3339_opts(SecondsFormat::Secs, true)))
                            .unwrap_or_default(),
                    );
                }
            }
        }
        Command::DeadLetters => {
            let dead_letters = queue.dead_letter_items().await;
            if json {
                print_json(&Value::Array(
                    dead_letters.iter().map(dead_letter_json).collect(),
                ))?;
            } else {
                for dead_letter in &dead_letters {
                    println!(
                        "{:>6}  {:<20} {:<6} {} after {} retries: {}",
                        dead_letter.id(),
                        dead_letter.key().to_string(),
                        dead_letter.change().kind(),
                        dead_letter.kind(),
                        dead_letter.retry_count(),
                        dead_letter.message(),
                    );
                }
            }
        }
        Command::Requeue { id } => {
            let record = queue
                .requeue_dead_letter(DeadLetterId::new(id))
                .await
                .with_context(|| format!("Failed to requeue dead letter {id}"))?;
            println!("Requeued {} as version {}", record.key(), record.version());
        }
        Command::Discard { id } => {
            let dead_letter = queue
                .discard_dead_letter(DeadLetterId::new(id))
                .await
                .with_context(|| format!("Failed to discard dead letter {id}"))?;
            println!("Discarded {} {}", dead_letter.change().kind(), dead_letter.key());
        }
    }

    Ok(())
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn record_json(record: &MutationRecord) -> Value {
    json!({
        "position": record.position(),
        "key": record.key(),
        "action": record.action(),
        "payload": record.payload().map(payload_json),
        "enqueued_at": record.enqueued_at(),
        "retry_count": record.retry_count(),
        "version": record.version(),
        "next_attempt_at": record.next_attempt_at(),
    })
}

fn dead_letter_json(dead_letter: &DeadLetter) -> Value {
    json!({
        "id": dead_letter.id().value(),
        "key": dead_letter.key(),
        "action": dead_letter.change().kind(),
        "payload": dead_letter.change().payload().map(payload_json),
        "enqueued_at": dead_letter.enqueued_at(),
        "retry_count": dead_letter.retry_count(),
        "version": dead_letter.version(),
        "failure": dead_letter.kind(),
        "message": dead_letter.message(),
        "failed_at": dead_letter.failed_at(),
    })
}

/// JSON payloads are shown as is, anything else by size.
fn payload_json(payload: &Payload) -> Value {
    payload
        .parse_json::<Value>()
        .unwrap_or_else(|_| json!({ "bytes": payload.len() }))
}
