// Byte counters for one peer session, windowed per keepalive round.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputStats {

    pub up: Counter,

    pub down: Counter,

}

impl ThroughputStats {
    pub fn reset_round(&mut self) {
        self.up.reset();
        self.down.reset();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    total: u64,
    round: u64,
    avg: f64,
}

impl Counter {

    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.round += n;
    }

    // Fold the finished round into a smoothed rate over the last 5 rounds.
    pub fn reset(&mut self) {
        self.avg = (self.avg * 4.0 / 5.0) + (self.round as f64 / 5.0);
        self.round = 0;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn avg(&self) -> u64 {
        self.avg as u64
    }
}
