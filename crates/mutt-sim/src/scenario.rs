//! Simulation scenarios. Each returns the number of messages it sent.

use anyhow::{bail, Result};
use mutt_core::packet::DEFAULT_TTL;
use rand::rngs::StdRng;
use rand::Rng;

use crate::sim::Sim;

const WORDS: &[&str] = &[
    "woof", "bark", "sniff", "ball", "walk", "treat", "squirrel", "park", "stick", "nap",
];

/// A short random sentence.
fn chatter(rng: &mut StdRng) -> String {
    let len = rng.random_range(1..=8);
    (0..len)
        .map(|_| WORDS[rng.random_range(0..WORDS.len())])
        .collect::<Vec<_>>()
        .join(" ")
}

fn spawn_devices(sim: &mut Sim, count: usize) -> Result<()> {
    for i in 0..count {
        sim.add_device(&format!("dog{i}"))?;
    }
    Ok(())
}

/// Every device in range of every other; random pairs exchange messages.
pub async fn chat(sim: &mut Sim, devices: usize, messages: usize, rng: &mut StdRng) -> Result<usize> {
    if devices < 2 {
        bail!("chat needs at least 2 devices");
    }
    spawn_devices(sim, devices)?;
    for a in 0..devices {
        for b in a + 1..devices {
            sim.link(a, b).await?;
        }
    }
    let exchanges = (devices * (devices - 1)) as u64;
    sim.wait_until("key exchanges", |t| t.key_exchanges >= exchanges).await?;

    for _ in 0..messages {
        let from = rng.random_range(0..devices);
        let to = (from + rng.random_range(1..devices)) % devices;
        let text = chatter(rng);
        sim.devices[from]
            .handle
            .send_message(&text, sim.devices[to].uuid())
            .await?;
    }
    let expected = messages as u64;
    sim.wait_until("deliveries", |t| t.received >= expected).await?;
    Ok(messages)
}

/// Devices in a line; the two ends only reach each other through relays.
pub async fn chain(sim: &mut Sim, devices: usize, messages: usize, rng: &mut StdRng) -> Result<usize> {
    if devices < 3 {
        bail!("chain needs at least 3 devices");
    }
    let max = DEFAULT_TTL as usize + 2;
    if devices > max {
        bail!("a bark survives {DEFAULT_TTL} relays; use at most {max} devices");
    }
    spawn_devices(sim, devices)?;
    for i in 0..devices - 1 {
        sim.link(i, i + 1).await?;
    }
    let exchanges = 2 * (devices as u64 - 1);
    sim.wait_until("key exchanges", |t| t.key_exchanges >= exchanges).await?;

    // the ends were introduced out of band
    let (first, last) = (0, devices - 1);
    let first_id = sim.devices[first].handle.local_identity().clone();
    let last_id = sim.devices[last].handle.local_identity().clone();
    sim.devices[first].handle.add_contact(last_id, None).await?;
    sim.devices[last].handle.add_contact(first_id, None).await?;

    for _ in 0..messages {
        let text = chatter(rng);
        sim.devices[first]
            .handle
            .send_message(&text, sim.devices[last].uuid())
            .await?;
    }
    let expected = messages as u64;
    sim.wait_until("relayed deliveries", |t| t.received >= expected).await?;
    Ok(messages)
}

/// Two devices drift apart, queue messages, and meet again.
pub async fn reconnect(sim: &mut Sim, messages: usize, rng: &mut StdRng) -> Result<usize> {
    spawn_devices(sim, 2)?;
    sim.link(0, 1).await?;
    sim.wait_until("key exchange", |t| t.key_exchanges >= 2).await?;

    sim.unlink(0, 1).await?;
    sim.wait_until("disconnect", |t| t.lost >= 2).await?;

    for _ in 0..messages {
        let text = chatter(rng);
        let receipt = sim.devices[0]
            .handle
            .send_message(&text, sim.devices[1].uuid())
            .await?;
        if receipt.dispatched {
            bail!("{} was dispatched with no one in range", receipt.key);
        }
    }

    sim.link(0, 1).await?;
    let expected = messages as u64;
    sim.wait_until("queued deliveries", |t| t.received >= expected).await?;
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutt_core::MuttConfig;
    use rand::SeedableRng;
    use std::time::Duration;

    fn sim() -> Sim {
        Sim::new(MuttConfig::new().in_memory(), Duration::from_secs(10))
    }

    #[test]
    fn chatter_uses_known_words() {
        let mut rng = StdRng::seed_from_u64(7);
        let text = chatter(&mut rng);
        assert!(text.split(' ').all(|w| WORDS.contains(&w)));
    }

    #[tokio::test]
    async fn chain_delivers_end_to_end() {
        let mut sim = sim();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(chain(&mut sim, 4, 3, &mut rng).await.unwrap(), 3);
        // two relays per message in a line of four
        sim.wait_until("relays", |t| t.relayed >= 6).await.unwrap();
        sim.shutdown().await;
    }

    #[tokio::test]
    async fn chain_rejects_long_lines() {
        let mut sim = sim();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(chain(&mut sim, DEFAULT_TTL as usize + 3, 1, &mut rng).await.is_err());
        assert!(sim.devices.is_empty());
    }

    #[tokio::test]
    async fn reconnect_flushes_queue() {
        let mut sim = sim();
        let mut rng = StdRng::seed_from_u64(2);
        reconnect(&mut sim, 4, &mut rng).await.unwrap();
        assert_eq!(sim.tally.received, 4);
        sim.wait_until("deferrals", |t| t.deferred >= 4).await.unwrap();
        sim.shutdown().await;
    }
}
