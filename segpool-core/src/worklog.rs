//! Peer-local segment log: four append-only sequences recording one worker's
//! history. Never shared with the pool except as the final done set sent via
//! `send-results`.

/// Append-only record of a peer instance's work. Not persisted: a restarted
/// peer rebuilds its delivered state from what its own drive already holds.
#[derive(Debug, Default, Clone)]
pub struct WorkLog {
    claimed: Vec<String>,
    processing: Vec<String>,
    done: Vec<String>,
    delivered: Vec<String>,
}

impl WorkLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A segment was assigned to this peer.
    pub fn claim(&mut self, path: impl Into<String>) {
        self.claimed.push(path.into());
    }

    /// The encode for a claimed segment started.
    pub fn start(&mut self, path: impl Into<String>) {
        self.processing.push(path.into());
    }

    /// The encode finished successfully.
    pub fn finish(&mut self, path: impl Into<String>) {
        self.done.push(path.into());
    }

    /// Results were acknowledged by the pool.
    pub fn deliver_all(&mut self, paths: impl IntoIterator<Item = String>) {
        self.delivered.extend(paths);
    }

    pub fn claimed(&self) -> &[String] {
        &self.claimed
    }

    pub fn processing(&self) -> &[String] {
        &self.processing
    }

    pub fn done(&self) -> &[String] {
        &self.done
    }

    pub fn delivered(&self) -> &[String] {
        &self.delivered
    }
}
