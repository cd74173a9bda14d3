//! Permission tiers and their resolution from server group membership.

use crate::domain::entities::ChatGroupId;

/// Ordered permission tiers. `Ord` follows privilege: `None` < ... < `Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PermissionTier {
    None,
    Guest,
    Member,
    Recruiter,
    Mod,
    DivisionCommander,
    Staff,
    Admin,
    Owner,
}

impl PermissionTier {
    /// Human readable name used in help output.
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "<none>",
            Self::Guest => "Guest",
            Self::Member => "Member",
            Self::Recruiter => "Recruiter",
            Self::Mod => "Moderator",
            Self::DivisionCommander => "Division Commander",
            Self::Staff => "Staff",
            Self::Admin => "Admin",
            Self::Owner => "Owner",
        }
    }

    /// Callers at or above this tier see internal error detail.
    pub fn is_privileged(self) -> bool {
        self >= Self::Mod
    }
}

/// Server groups granting each tier. Owner is granted by identity only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierGroups {
    pub owner_unique_ids: Vec<String>,
    pub admin: Vec<ChatGroupId>,
    pub staff: Vec<ChatGroupId>,
    pub division_command: Vec<ChatGroupId>,
    pub moderator: Vec<ChatGroupId>,
    pub recruiter: Vec<ChatGroupId>,
    pub member: Vec<ChatGroupId>,
    pub guest: Vec<ChatGroupId>,
}

impl TierGroups {
    /// Highest tier matched by `groups`; identities in the owner list always resolve to `Owner`.
    pub fn resolve(&self, unique_id: &str, groups: &[ChatGroupId]) -> PermissionTier {
        if self.owner_unique_ids.iter().any(|id| id == unique_id) {
            return PermissionTier::Owner;
        }
        let ladder: [(&[ChatGroupId], PermissionTier); 7] = [
            (&self.admin, PermissionTier::Admin),
            (&self.staff, PermissionTier::Staff),
            (&self.division_command, PermissionTier::DivisionCommander),
            (&self.moderator, PermissionTier::Mod),
            (&self.recruiter, PermissionTier::Recruiter),
            (&self.member, PermissionTier::Member),
            (&self.guest, PermissionTier::Guest),
        ];
        ladder
            .iter()
            .find(|(tier_groups, _)| groups.iter().any(|g| tier_groups.contains(g)))
            .map(|(_, tier)| *tier)
            .unwrap_or(PermissionTier::None)
    }
}
