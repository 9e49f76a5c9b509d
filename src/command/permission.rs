//! Guild permissions checked before a command runs.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single guild permission.
///
/// Declaration order is the order in which required permissions are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    Administrator,
    ManageGuild,
    ManageChannels,
    ManageRoles,
    ManageMessages,
    KickMembers,
    BanMembers,
    ModerateMembers,
    MuteMembers,
    MoveMembers,
    SendMessages,
    EmbedLinks,
    AttachFiles,
    Connect,
    Speak,
}

impl Permission {
    /// Human readable name used in denial messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            Permission::Administrator => "Administrator",
            Permission::ManageGuild => "Manage Server",
            Permission::ManageChannels => "Manage Channels",
            Permission::ManageRoles => "Manage Roles",
            Permission::ManageMessages => "Manage Messages",
            Permission::KickMembers => "Kick Members",
            Permission::BanMembers => "Ban Members",
            Permission::ModerateMembers => "Timeout Members",
            Permission::MuteMembers => "Mute Members",
            Permission::MoveMembers => "Move Members",
            Permission::SendMessages => "Send Messages",
            Permission::EmbedLinks => "Embed Links",
            Permission::AttachFiles => "Attach Files",
            Permission::Connect => "Connect",
            Permission::Speak => "Speak",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// An ordered set of permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, permission: Permission) -> bool {
        self.0.insert(permission)
    }

    /// Whether the set grants `permission`. Administrator grants everything.
    pub fn grants(&self, permission: Permission) -> bool {
        self.0.contains(&Permission::Administrator) || self.0.contains(&permission)
    }

    /// First permission in `required` that this set does not grant.
    pub fn first_missing(&self, required: &PermissionSet) -> Option<Permission> {
        required.iter().find(|p| !self.grants(*p))
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Permission; N]> for PermissionSet {
    fn from(permissions: [Permission; N]) -> Self {
        permissions.into_iter().collect()
    }
}
