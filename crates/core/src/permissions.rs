//! Permission gate: which `module:action` permissions an account holds and
//! which owner groups it may see.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::types::{GroupModules, GroupType, Id, Role};

/// A single `module:action` permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    AdminUsers,
    AdminGroups,
    AdminManufacturers,
    AdminSettings,
    ContractorsRead,
    ProposalsRead,
    ProposalsCreate,
    ProposalsUpdate,
    ProposalsDelete,
    ProposalsAccept,
    CustomersRead,
    CustomersCreate,
    CustomersUpdate,
    CustomersDelete,
    ResourcesRead,
    ManufacturersRead,
}

impl Permission {
    pub const ALL: [Permission; 16] = [
        Self::AdminUsers,
        Self::AdminGroups,
        Self::AdminManufacturers,
        Self::AdminSettings,
        Self::ContractorsRead,
        Self::ProposalsRead,
        Self::ProposalsCreate,
        Self::ProposalsUpdate,
        Self::ProposalsDelete,
        Self::ProposalsAccept,
        Self::CustomersRead,
        Self::CustomersCreate,
        Self::CustomersUpdate,
        Self::CustomersDelete,
        Self::ResourcesRead,
        Self::ManufacturersRead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdminUsers => "admin:users",
            Self::AdminGroups => "admin:groups",
            Self::AdminManufacturers => "admin:manufacturers",
            Self::AdminSettings => "admin:settings",
            Self::ContractorsRead => "contractors:read",
            Self::ProposalsRead => "proposals:read",
            Self::ProposalsCreate => "proposals:create",
            Self::ProposalsUpdate => "proposals:update",
            Self::ProposalsDelete => "proposals:delete",
            Self::ProposalsAccept => "proposals:accept",
            Self::CustomersRead => "customers:read",
            Self::CustomersCreate => "customers:create",
            Self::CustomersUpdate => "customers:update",
            Self::CustomersDelete => "customers:delete",
            Self::ResourcesRead => "resources:read",
            Self::ManufacturersRead => "manufacturers:read",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|permission| permission.as_str() == value)
    }

    fn is_admin_only(self) -> bool {
        matches!(
            self,
            Self::AdminUsers | Self::AdminGroups | Self::AdminManufacturers | Self::AdminSettings
        )
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Returns `true` for roles that bypass permission checks and group scoping.
pub fn is_admin_role(role: Role) -> bool {
    matches!(role, Role::Admin | Role::SuperAdmin | Role::Manufacturer)
}

/// Permissions granted by group membership.
pub fn group_permissions(group_type: GroupType, modules: GroupModules) -> PermissionSet {
    let mut set = PermissionSet::default();
    set.insert(Permission::ManufacturersRead);

    match group_type {
        GroupType::Standard => {
            for permission in Permission::ALL {
                if !permission.is_admin_only() {
                    set.insert(permission);
                }
            }
        }
        GroupType::Contractor => {
            if modules.dashboard {
                set.insert(Permission::ContractorsRead);
            }
            if modules.proposals {
                set.extend([
                    Permission::ProposalsRead,
                    Permission::ProposalsCreate,
                    Permission::ProposalsUpdate,
                    Permission::ProposalsAccept,
                ]);
            }
            if modules.customers {
                set.extend([
                    Permission::CustomersRead,
                    Permission::CustomersCreate,
                    Permission::CustomersUpdate,
                    Permission::CustomersDelete,
                ]);
            }
            if modules.resources {
                set.insert(Permission::ResourcesRead);
            }
        }
    }

    set
}

/// Resolved set of permissions for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn all() -> Self {
        Self(Permission::ALL.into_iter().collect())
    }

    pub fn insert(&mut self, permission: Permission) {
        self.0.insert(permission);
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    pub fn has_any(&self, permissions: &[Permission]) -> bool {
        permissions.iter().any(|permission| self.has(*permission))
    }

    pub fn has_all(&self, permissions: &[Permission]) -> bool {
        permissions.iter().all(|permission| self.has(*permission))
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }
}

impl Extend<Permission> for PermissionSet {
    fn extend<T: IntoIterator<Item = Permission>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

/// Rows an account may see, keyed by owner group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupScope {
    All,
    Group(Id),
    /// Members without a group only see records no group owns.
    Unowned,
}

impl GroupScope {
    /// Ownership check for a single record.
    pub fn can_access(self, owner_group_id: Option<Id>) -> bool {
        match self {
            Self::All => true,
            Self::Group(id) => owner_group_id == Some(id),
            Self::Unowned => owner_group_id.is_none(),
        }
    }

    /// Group id stamped on records this account creates.
    pub fn owner_for_new(self) -> Option<Id> {
        match self {
            Self::Group(id) => Some(id),
            Self::All | Self::Unowned => None,
        }
    }
}

/// Group facts needed to resolve permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorGroup {
    pub id: Id,
    pub group_type: GroupType,
    pub modules: GroupModules,
}

/// The authenticated account behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Id,
    pub role: Role,
    pub group: Option<ActorGroup>,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        is_admin_role(self.role)
    }

    pub fn permissions(&self) -> PermissionSet {
        if self.is_admin() {
            return PermissionSet::all();
        }
        match self.group {
            Some(group) => group_permissions(group.group_type, group.modules),
            None => group_permissions(GroupType::Standard, GroupModules::default()),
        }
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.permissions().has(permission)
    }

    pub fn scope(&self) -> GroupScope {
        if self.is_admin() {
            return GroupScope::All;
        }
        match self.group {
            Some(group) => GroupScope::Group(group.id),
            None => GroupScope::Unowned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contractor(modules: GroupModules) -> Actor {
        Actor {
            user_id: 7,
            role: Role::Contractor,
            group: Some(ActorGroup {
                id: 3,
                group_type: GroupType::Contractor,
                modules,
            }),
        }
    }

    #[test]
    fn admin_roles_receive_everything() {
        for role in [Role::Admin, Role::SuperAdmin, Role::Manufacturer] {
            let actor = Actor {
                user_id: 1,
                role,
                group: None,
            };
            assert!(actor.permissions().has_all(&Permission::ALL));
            assert_eq!(actor.scope(), GroupScope::All);
        }
        assert!(!is_admin_role(Role::Sales));
    }

    #[test]
    fn contractor_permissions_follow_modules() {
        let actor = contractor(GroupModules {
            proposals: true,
            ..GroupModules::default()
        });
        let permissions = actor.permissions();
        assert!(permissions.has(Permission::ProposalsAccept));
        assert!(!permissions.has(Permission::ProposalsDelete));
        assert!(!permissions.has(Permission::CustomersRead));
        assert!(permissions.has(Permission::ManufacturersRead));
        assert!(!permissions.has_any(&[Permission::AdminUsers, Permission::AdminGroups]));
    }

    #[test]
    fn contractor_without_modules_is_denied() {
        let actor = contractor(GroupModules::default());
        assert!(!actor.can(Permission::ProposalsRead));
        assert!(!actor.can(Permission::CustomersCreate));
        assert!(!actor.can(Permission::ContractorsRead));
    }

    #[test]
    fn standard_members_get_non_admin_set() {
        let actor = Actor {
            user_id: 2,
            role: Role::Sales,
            group: None,
        };
        let permissions = actor.permissions();
        assert!(permissions.has_all(&[Permission::ProposalsDelete, Permission::CustomersDelete]));
        assert!(!permissions.has(Permission::AdminSettings));
        assert_eq!(actor.scope(), GroupScope::Unowned);
    }

    #[test]
    fn scope_checks_ownership() {
        assert!(GroupScope::All.can_access(Some(9)));
        assert!(GroupScope::Group(3).can_access(Some(3)));
        assert!(!GroupScope::Group(3).can_access(Some(4)));
        assert!(!GroupScope::Group(3).can_access(None));
        assert!(GroupScope::Unowned.can_access(None));
        assert!(!GroupScope::Unowned.can_access(Some(1)));
        assert_eq!(GroupScope::Group(3).owner_for_new(), Some(3));
    }

    #[test]
    fn permission_strings_round_trip() {
        for permission in Permission::ALL {
            assert_eq!(Permission::parse(permission.as_str()), Some(permission));
        }
        let json = serde_json::to_value(PermissionSet::all()).expect("serialize");
        assert!(json.as_array().expect("array").contains(&"proposals:accept".into()));
    }
}
