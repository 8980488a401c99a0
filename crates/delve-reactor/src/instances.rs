//! Instance lifecycle events reported by the servers themselves.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info};

use delve_core::epoch_secs;
use delve_lock::kinds;
use delve_state::*;

use crate::error::{ReactorError, ReactorResult};
use crate::reactor::{EventReactor, server_of};

impl EventReactor {
    /// (Re)register an instance as starting. Every lease or rebuild flag a
    /// previous incarnation held is dropped.
    pub(crate) fn server_online(&self, event: &NewEvent) -> ReactorResult<()> {
        let name = server_of(event)?;
        let address = event
            .source_ip
            .as_deref()
            .ok_or(ReactorError::MissingField("sourceIP"))?;
        let now = epoch_secs();
        let key = instance_key(name, address);

        let mut inst = self
            .ctx
            .state
            .get_instance(&key)?
            .unwrap_or_else(|| DungeonInstance::new(name, address, now));
        inst.state = InstanceStatus::Starting;
        inst.capabilities = CapabilitySet::from_metadata(&event.metadata);
        inst.clear_reservation();
        inst.requires_rebuild = false;
        inst.in_use_at = None;
        inst.active_players = 0;
        inst.healthy_since = None;
        inst.unhealthy_since = None;
        inst.updated_at = now;
        self.ctx.state.put_instance(&inst)?;
        info!(%name, %address, "instance online");
        Ok(())
    }

    pub(crate) fn server_closing(&self, event: &NewEvent) -> ReactorResult<()> {
        let name = server_of(event)?;
        let now = epoch_secs();
        let closing = self.targets(event)?;
        if closing.is_empty() {
            debug!(%name, "closing server is not registered");
        }
        for inst in closing {
            self.ctx.state.update_instance(&inst.table_key(), |i| {
                i.state = InstanceStatus::Rebuilding;
                i.requires_rebuild = true;
                i.clear_reservation();
                i.updated_at = now;
                true
            })?;
        }
        Ok(())
    }

    pub(crate) fn dungeon_ready(&self, event: &NewEvent) -> ReactorResult<()> {
        let ready = self.existing_targets(event)?;
        let capabilities = (!event.metadata.is_empty())
            .then(|| CapabilitySet::from_metadata(&event.metadata));
        for inst in ready {
            self.mark_ready(&inst, capabilities.clone())?;
        }
        Ok(())
    }

    /// The server went away for good: forget it and release whatever it
    /// leased.
    pub(crate) async fn dungeon_closed(&self, event: &NewEvent) -> ReactorResult<()> {
        for inst in self.existing_targets(event)? {
            self.ctx.state.delete_instance(&inst.table_key())?;
            let reason = format!("instance {} closed", inst.name);
            let released = self.ledger.release_instance_claims(&inst, &reason).await?;
            info!(name = %inst.name, address = %inst.address, released = released.len(), "instance closed");
        }
        Ok(())
    }

    /// Send everyone on the dungeon back to the lobby, close their runs and
    /// make the instance available again.
    pub(crate) fn clear_dungeon(&self, event: &NewEvent) -> ReactorResult<()> {
        let name = server_of(event)?;
        let cleared = self.existing_targets(event)?;
        let lobby = self.ctx.config.lobby_server.as_str();
        let now = epoch_secs();

        let occupants: Vec<Player> = self
            .ctx
            .state
            .list_players()?
            .into_iter()
            .filter(|p| p.server == name && p.state == PlayerState::InDungeon)
            .collect();
        for player in &occupants {
            self.ctx.commands.connect_player(name, &player.name, lobby)?;
            let claim = self.ctx.state.active_claim_for(&player.name)?;
            self.ctx.state.update_player(&player.name, |p| {
                p.return_to_lobby(now);
                p.server = lobby.to_string();
            })?;
            if let Some(claim) = claim {
                self.ledger.finalize(&claim.id)?;
            }
        }

        for inst in cleared {
            self.mark_ready(&inst, None)?;
        }
        info!(%name, players = occupants.len(), "dungeon cleared");
        Ok(())
    }

    pub(crate) async fn shutdown_all_empty(&self, _event: &NewEvent) -> ReactorResult<()> {
        let ttl = Duration::from_secs(self.ctx.config.automation_lock_secs);
        if !self.ctx.locker.try_acquire(kinds::SHUTDOWN_ALL, "all", ttl).await? {
            debug!("empty dungeon shutdown already requested");
            return Ok(());
        }

        let empty: BTreeSet<String> = self
            .ctx
            .state
            .list_instances()?
            .into_iter()
            .filter(|i| self.ctx.pool.is_pool(&i.name))
            .filter(|i| i.active_players == 0 && i.reserved_by.is_none())
            .map(|i| i.name)
            .collect();
        for name in &empty {
            self.ctx.commands.shutdown_if_empty(name)?;
        }
        info!(count = empty.len(), "empty dungeons told to shut down");
        Ok(())
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Instances an event refers to: the exact record when the event
    /// carries a source address, otherwise every record under the name.
    fn targets(&self, event: &NewEvent) -> ReactorResult<Vec<DungeonInstance>> {
        let name = server_of(event)?;
        match event.source_ip.as_deref() {
            Some(address) => Ok(self
                .ctx
                .state
                .get_instance(&instance_key(name, address))?
                .into_iter()
                .collect()),
            None => Ok(self.ctx.state.instances_named(name)?),
        }
    }

    fn existing_targets(&self, event: &NewEvent) -> ReactorResult<Vec<DungeonInstance>> {
        let found = self.targets(event)?;
        if found.is_empty() {
            return Err(ReactorError::InstanceNotFound(server_of(event)?.to_string()));
        }
        Ok(found)
    }

    fn mark_ready(&self, inst: &DungeonInstance, capabilities: Option<CapabilitySet>) -> ReactorResult<()> {
        let now = epoch_secs();
        self.ctx.state.update_instance(&inst.table_key(), |i| {
            i.state = InstanceStatus::Available;
            i.healthy_since.get_or_insert(now);
            i.unhealthy_since = None;
            i.clear_reservation();
            i.requires_rebuild = false;
            i.in_use_at = None;
            i.active_players = 0;
            if let Some(capabilities) = capabilities {
                i.capabilities = capabilities;
            }
            i.updated_at = now;
            true
        })?;
        debug!(name = %inst.name, address = %inst.address, "instance ready");
        Ok(())
    }
}
