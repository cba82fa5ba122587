use serde::Serialize;

use crate::sim::{Sim, Tally};

/// Outcome of one run, printed as text or JSON.
#[derive(Debug, Serialize)]
pub struct Report {
    pub event: &'static str,
    pub scenario: String,
    pub seed: u64,
    pub devices: usize,
    pub sent: usize,
    pub frames: usize,
    pub dropped_frames: u64,
    pub elapsed_ms: u64,
    pub tally: Tally,
}

impl Report {
    pub fn new(scenario: &str, seed: u64, sent: usize, elapsed_ms: u64, sim: &Sim) -> Self {
        Self {
            event: "summary",
            scenario: scenario.to_string(),
            seed,
            devices: sim.devices.len(),
            sent,
            frames: sim.network.sent_frames().len(),
            dropped_frames: sim.network.dropped_frames(),
            elapsed_ms,
            tally: sim.tally.clone(),
        }
    }

    pub fn print_human(&self) {
        let t = &self.tally;
        println!("scenario   {} (seed {})", self.scenario, self.seed);
        println!("devices    {}", self.devices);
        println!("sent       {}", self.sent);
        println!("received   {}", t.received);
        println!("relayed    {}", t.relayed);
        println!("delivered  {}", t.delivered);
        println!("to mesh    {}", t.mesh_handoffs);
        println!("deferred   {}", t.deferred);
        println!("exchanges  {}", t.key_exchanges);
        println!("frames     {} ({} dropped)", self.frames, self.dropped_frames);
        println!("errors     {}", t.errors);
        if t.bans > 0 || t.key_conflicts > 0 {
            println!("bans       {} (key conflicts {})", t.bans, t.key_conflicts);
        }
        println!("elapsed    {} ms", self.elapsed_ms);
    }

    pub fn print_json(&self) {
        match serde_json::to_string(self) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("could not encode report: {e}"),
        }
    }
}
