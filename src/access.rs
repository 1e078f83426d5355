use crate::error::{EngineError, Result};
use crate::model::{AccessLevel, Game, PublicLevel, Team, UserAccessPolicy};

fn public_as_level(public: PublicLevel) -> AccessLevel {
    match public {
        PublicLevel::None => AccessLevel::None,
        PublicLevel::Read => AccessLevel::Read,
        PublicLevel::Write => AccessLevel::Write,
        PublicLevel::Admin => AccessLevel::Admin,
    }
}

/// Ambient identity inputs for one resolution.
#[derive(Clone, Copy)]
pub struct Principal<'a> {
    pub user: Option<&'a str>,
    /// The `--admin` bootstrap operator, if configured.
    pub bootstrap_admin: Option<&'a str>,
}

impl<'a> Principal<'a> {
    pub fn anonymous() -> Self {
        Self {
            user: None,
            bootstrap_admin: None,
        }
    }

    pub fn is_admin(&self, policy: &UserAccessPolicy) -> bool {
        match self.user {
            Some(u) => self.bootstrap_admin == Some(u) || policy.is_admin(u),
            None => false,
        }
    }
}

/// Effective level of `who` on `game`. Team role inheritance consults the
/// game's away/home teams when the caller has them loaded.
pub fn game_access(
    who: Principal<'_>,
    policy: &UserAccessPolicy,
    game: &Game,
    away: Option<&Team>,
    home: Option<&Team>,
) -> AccessLevel {
    let Some(user) = who.user else {
        // Anonymous callers never exceed Read no matter how open the game is.
        return public_as_level(game.permissions.public).min(AccessLevel::Read);
    };

    if who.is_admin(policy) {
        return AccessLevel::Admin;
    }
    if !policy.allows(user) {
        return AccessLevel::None;
    }
    if game.owner == user {
        return AccessLevel::Admin;
    }
    if let Some(level) = game.permissions.users.get(user) {
        return *level;
    }

    let mut inherited = AccessLevel::None;
    for team in [away, home].into_iter().flatten() {
        if team.roles.admins.contains(user) {
            inherited = inherited.max(AccessLevel::Admin);
        } else if team.roles.scorekeepers.contains(user) {
            inherited = inherited.max(AccessLevel::Write);
        } else if team.roles.spectators.contains(user) {
            inherited = inherited.max(AccessLevel::Read);
        }
    }
    if inherited != AccessLevel::None {
        return inherited;
    }

    public_as_level(game.permissions.public)
}

pub fn team_access(who: Principal<'_>, policy: &UserAccessPolicy, team: &Team) -> AccessLevel {
    let Some(user) = who.user else {
        return AccessLevel::None;
    };
    if who.is_admin(policy) {
        return AccessLevel::Admin;
    }
    if !policy.allows(user) {
        return AccessLevel::None;
    }
    if team.owner == user || team.roles.admins.contains(user) {
        return AccessLevel::Admin;
    }
    if team.roles.scorekeepers.contains(user) {
        return AccessLevel::Write;
    }
    if team.roles.spectators.contains(user) {
        return AccessLevel::Read;
    }
    AccessLevel::None
}

pub fn check_game_quota(policy: &UserAccessPolicy, email: &str, current: usize) -> Result<()> {
    let max = policy.max_games_for(email);
    if max > 0 && current >= max as usize {
        return Err(EngineError::QuotaExceeded(format!(
            "game quota of {max} reached"
        )));
    }
    Ok(())
}

pub fn check_team_quota(policy: &UserAccessPolicy, email: &str, current: usize) -> Result<()> {
    let max = policy.max_teams_for(email);
    if max > 0 && current >= max as usize {
        return Err(EngineError::QuotaExceeded(format!(
            "team quota of {max} reached"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::policy::{DefaultPolicy, UserOverride};

    fn principal(user: Option<&'static str>) -> Principal<'static> {
        Principal {
            user,
            bootstrap_admin: None,
        }
    }

    fn base_game() -> Game {
        let mut g = Game::new("g");
        g.owner = "owner@e".into();
        g
    }

    #[test]
    fn anonymous_capped_at_read() {
        let policy = UserAccessPolicy::default();
        let mut game = base_game();
        game.permissions.public = PublicLevel::Write;
        assert_eq!(
            game_access(Principal::anonymous(), &policy, &game, None, None),
            AccessLevel::Read
        );
        game.permissions.public = PublicLevel::None;
        assert_eq!(
            game_access(Principal::anonymous(), &policy, &game, None, None),
            AccessLevel::None
        );
    }

    #[test]
    fn owner_and_admins_get_admin() {
        let mut policy = UserAccessPolicy::default();
        policy.admins.insert("root@e".into());
        let game = base_game();
        assert_eq!(
            game_access(principal(Some("owner@e")), &policy, &game, None, None),
            AccessLevel::Admin
        );
        assert_eq!(
            game_access(principal(Some("root@e")), &policy, &game, None, None),
            AccessLevel::Admin
        );
        let boot = Principal {
            user: Some("ops@e"),
            bootstrap_admin: Some("ops@e"),
        };
        assert_eq!(
            game_access(boot, &policy, &game, None, None),
            AccessLevel::Admin
        );
    }

    #[test]
    fn explicit_grant_beats_team_roles() {
        let policy = UserAccessPolicy::default();
        let mut game = base_game();
        game.permissions
            .users
            .insert("scout@e".into(), AccessLevel::Read);
        let mut team = Team::default();
        team.roles.scorekeepers.insert("scout@e".into());
        assert_eq!(
            game_access(principal(Some("scout@e")), &policy, &game, Some(&team), None),
            AccessLevel::Read
        );
    }

    #[test]
    fn team_roles_inherit() {
        let policy = UserAccessPolicy::default();
        let game = base_game();
        let mut team = Team::default();
        team.roles.scorekeepers.insert("keeper@e".into());
        team.roles.spectators.insert("fan@e".into());
        assert_eq!(
            game_access(principal(Some("keeper@e")), &policy, &game, None, Some(&team)),
            AccessLevel::Write
        );
        assert_eq!(
            game_access(principal(Some("fan@e")), &policy, &game, Some(&team), None),
            AccessLevel::Read
        );
    }

    #[test]
    fn deny_override_wins() {
        let mut policy = UserAccessPolicy::default();
        policy.overrides.insert(
            "banned@e".into(),
            UserOverride {
                access: DefaultPolicy::Deny,
                ..Default::default()
            },
        );
        let mut game = base_game();
        game.permissions.public = PublicLevel::Write;
        assert_eq!(
            game_access(principal(Some("banned@e")), &policy, &game, None, None),
            AccessLevel::None
        );
    }

    #[test]
    fn quota_checks() {
        let mut policy = UserAccessPolicy::default();
        policy.default_max_games = 2;
        assert!(check_game_quota(&policy, "u@e", 1).is_ok());
        assert!(check_game_quota(&policy, "u@e", 2).is_err());
        policy.overrides.insert(
            "big@e".into(),
            UserOverride {
                max_games: 10,
                ..Default::default()
            },
        );
        assert!(check_game_quota(&policy, "big@e", 2).is_ok());
        // Zero max disables the quota entirely.
        policy.default_max_games = 0;
        assert!(check_game_quota(&policy, "u@e", 10_000).is_ok());
    }
}
