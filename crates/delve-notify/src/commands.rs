//! Outbound command queue.
//!
//! Each helper appends one `SCHEDULED` task addressed to a game server.
//! Servers consume tasks in key order (UUID v7, so creation order).

use tracing::debug;

use delve_core::epoch_secs;
use delve_state::{CommandType, StateResult, StateStore, Task};

#[derive(Clone)]
pub struct CommandQueue {
    state: StateStore,
}

impl CommandQueue {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Append a task. The building block for every helper below.
    pub fn enqueue(
        &self,
        server: &str,
        command: CommandType,
        target_player: Option<&str>,
        arguments: Vec<String>,
    ) -> StateResult<Task> {
        let mut task = Task::scheduled(server, command, epoch_secs());
        task.target_player = target_player.map(str::to_string);
        task.arguments = arguments;
        self.state.push_task(&task)?;
        debug!(%server, ?command, player = ?target_player, "command enqueued");
        Ok(task)
    }

    pub fn message_player(&self, server: &str, player: &str, text: &str) -> StateResult<Task> {
        self.enqueue(
            server,
            CommandType::MessagePlayer,
            Some(player),
            vec![text.to_string()],
        )
    }

    pub fn message_ops(&self, server: &str, text: &str) -> StateResult<Task> {
        self.enqueue(server, CommandType::MessageOps, None, vec![text.to_string()])
    }

    /// Ask `via_server` (where the player currently is) to move the player
    /// to `destination`.
    pub fn connect_player(
        &self,
        via_server: &str,
        player: &str,
        destination: &str,
    ) -> StateResult<Task> {
        self.enqueue(
            via_server,
            CommandType::ConnectPlayer,
            Some(player),
            vec![destination.to_string()],
        )
    }

    pub fn send_title(
        &self,
        server: &str,
        player: &str,
        title: &str,
        subtitle: &str,
    ) -> StateResult<Task> {
        self.enqueue(
            server,
            CommandType::SendTitle,
            Some(player),
            vec![title.to_string(), subtitle.to_string()],
        )
    }

    pub fn play_sound(&self, server: &str, player: &str, sound: &str) -> StateResult<Task> {
        self.enqueue(
            server,
            CommandType::PlaySound,
            Some(player),
            vec![sound.to_string()],
        )
    }

    pub fn shutdown_if_empty(&self, server: &str) -> StateResult<Task> {
        self.enqueue(server, CommandType::ShutdownServerIfEmpty, None, Vec::new())
    }

    /// Tell a reserved dungeon who is about to arrive. `arguments` carries
    /// the claim's run settings as `key=value` pairs.
    pub fn prepare_for_player(
        &self,
        server: &str,
        player: &str,
        arguments: Vec<String>,
    ) -> StateResult<Task> {
        self.enqueue(server, CommandType::PrepareForPlayer, Some(player), arguments)
    }

    pub fn broadcast(&self, server: &str, text: &str) -> StateResult<Task> {
        self.enqueue(
            server,
            CommandType::BroadcastMessage,
            None,
            vec![text.to_string()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_state::TaskState;

    #[test]
    fn message_player_targets_player() {
        let state = StateStore::open_in_memory().unwrap();
        let queue = CommandQueue::new(state.clone());

        queue.message_player("lobby", "alex", "hello").unwrap();

        let tasks = state.list_tasks().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].command, CommandType::MessagePlayer);
        assert_eq!(tasks[0].target_player.as_deref(), Some("alex"));
        assert_eq!(tasks[0].arguments, vec!["hello".to_string()]);
        assert_eq!(tasks[0].state, TaskState::Scheduled);
    }

    #[test]
    fn connect_player_is_sent_to_current_server() {
        let state = StateStore::open_in_memory().unwrap();
        let queue = CommandQueue::new(state.clone());

        let task = queue.connect_player("lobby", "alex", "d001").unwrap();
        assert_eq!(task.server, "lobby");
        assert_eq!(task.arguments, vec!["d001".to_string()]);
        assert_eq!(state.tasks_for_server("lobby").unwrap().len(), 1);
    }

    #[test]
    fn shutdown_if_empty_has_no_player() {
        let state = StateStore::open_in_memory().unwrap();
        let queue = CommandQueue::new(state);

        let task = queue.shutdown_if_empty("d004").unwrap();
        assert_eq!(task.command, CommandType::ShutdownServerIfEmpty);
        assert!(task.target_player.is_none());
    }
}
