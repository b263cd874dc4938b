use std::time::Duration;
use tokio::time::Instant;

/// Result of buffering one join
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinBatch {
    /// Message ready to enqueue
    Ready(String),
    Buffering,
}

/// Joins collected since the first unflushed one
#[derive(Debug, Clone)]
pub struct BufferedJoins {
    pub usernames: Vec<String>,
    pub player_count: usize,
    pub max_players: u32,
}

/// Coalesces consecutive joins of one chat into a single message
#[derive(Debug, Default)]
pub struct JoinBuffer {
    usernames: Vec<String>,
    first_at: Option<Instant>,
    player_count: usize,
    max_players: u32,
}

impl JoinBuffer {
    /// Add a join; returns the batch when it should be sent now
    pub fn push(
        &mut self,
        username: &str,
        player_count: usize,
        max_players: u32,
        batch_size: usize,
        window: Duration,
        now: Instant,
    ) -> Option<BufferedJoins> {
        let first_at = *self.first_at.get_or_insert(now);
        self.usernames.push(username.to_string());
        self.player_count = player_count;
        self.max_players = max_players;

        let full_batch = self.usernames.len() >= batch_size;
        let at_capacity = player_count >= max_players as usize;
        let window_elapsed = now.duration_since(first_at) >= window;

        if full_batch || at_capacity || window_elapsed {
            self.take()
        } else {
            None
        }
    }

    /// Whether this push opened a new batch (a flush must be scheduled)
    pub fn is_fresh(&self) -> bool {
        self.usernames.len() == 1
    }

    pub fn is_empty(&self) -> bool {
        self.usernames.is_empty()
    }

    pub fn take(&mut self) -> Option<BufferedJoins> {
        if self.usernames.is_empty() {
            return None;
        }
        self.first_at = None;
        Some(BufferedJoins {
            usernames: std::mem::take(&mut self.usernames),
            player_count: self.player_count,
            max_players: self.max_players,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(3);

    #[test]
    fn test_ready_when_batch_size_reached() {
        let mut buffer = JoinBuffer::default();
        let now = Instant::now();

        assert!(buffer.push("alice", 1, 50, 3, WINDOW, now).is_none());
        assert!(buffer.push("bob", 2, 50, 3, WINDOW, now).is_none());
        let batch = buffer.push("carol", 3, 50, 3, WINDOW, now).expect("batch");

        assert_eq!(batch.usernames, vec!["alice", "bob", "carol"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_ready_at_capacity() {
        let mut buffer = JoinBuffer::default();
        let batch = buffer.push("alice", 2, 2, 5, WINDOW, Instant::now()).expect("batch");
        assert_eq!(batch.player_count, 2);
    }

    #[test]
    fn test_ready_after_window() {
        let mut buffer = JoinBuffer::default();
        let start = Instant::now();

        assert!(buffer.push("alice", 1, 50, 5, WINDOW, start).is_none());
        let batch = buffer
            .push("bob", 2, 50, 5, WINDOW, start + Duration::from_secs(4))
            .expect("batch");
        assert_eq!(batch.usernames.len(), 2);
    }
}
