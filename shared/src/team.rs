//! Team membership and damage rules

use bevy::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

use crate::weapons::trace::ActorId;

pub type TeamId = i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeamComparison {
    OnSameTeam,
    DifferentTeams,
    /// At least one side has no team.
    InvalidArgument,
}

/// Per-world team registry.
#[derive(Resource, Clone, Debug, Default)]
pub struct TeamSubsystem {
    teams: BTreeMap<ActorId, TeamId>,
    /// Actors that carry an ability system and so can take damage without a team.
    damageable: BTreeSet<ActorId>,
}

impl TeamSubsystem {
    pub fn set_team(&mut self, actor: ActorId, team: TeamId) {
        self.teams.insert(actor, team);
        self.damageable.insert(actor);
    }

    pub fn clear_team(&mut self, actor: ActorId) {
        self.teams.remove(&actor);
    }

    pub fn register_damageable(&mut self, actor: ActorId) {
        self.damageable.insert(actor);
    }

    pub fn remove_actor(&mut self, actor: ActorId) {
        self.teams.remove(&actor);
        self.damageable.remove(&actor);
    }

    pub fn team_of(&self, actor: ActorId) -> Option<TeamId> {
        self.teams.get(&actor).copied()
    }

    pub fn compare_teams(&self, a: ActorId, b: ActorId) -> TeamComparison {
        match (self.team_of(a), self.team_of(b)) {
            (Some(x), Some(y)) if x == y => TeamComparison::OnSameTeam,
            (Some(_), Some(_)) => TeamComparison::DifferentTeams,
            _ => TeamComparison::InvalidArgument,
        }
    }

    /// Enemies can be damaged. A teamed instigator may also damage team-less actors that have an
    /// ability system (training dummies).
    pub fn can_cause_damage(&self, instigator: ActorId, target: ActorId, allow_damage_to_self: bool) -> bool {
        if allow_damage_to_self && instigator == target {
            return true;
        }
        match self.compare_teams(instigator, target) {
            TeamComparison::DifferentTeams => true,
            TeamComparison::InvalidArgument => {
                self.team_of(instigator).is_some() && self.damageable.contains(&target)
            }
            TeamComparison::OnSameTeam => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_damage_rules() {
        let mut teams = TeamSubsystem::default();
        teams.set_team(1, 0);
        teams.set_team(2, 1);
        teams.set_team(3, 0);
        teams.register_damageable(10);

        assert!(teams.can_cause_damage(1, 2, false));
        assert!(!teams.can_cause_damage(1, 3, false));
        assert!(!teams.can_cause_damage(1, 3, true));
        assert!(teams.can_cause_damage(1, 1, true));
        assert!(teams.can_cause_damage(1, 10, false));
        assert!(!teams.can_cause_damage(1, 99, false));
        assert!(!teams.can_cause_damage(99, 2, false));
    }
}
