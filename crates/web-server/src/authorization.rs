//! Principals and the access-control list guarding the views.

use database::models::User;
use std::fmt;
use uuid::Uuid;

/// Granted to any signed-in user by the root ACL.
pub const AUTHENTICATED: &str = "authenticated";
/// Needed by the JSON data endpoints.
pub const READ: &str = "read";
/// Needed to see the user management section of the home page.
pub const MANAGE_USERS: &str = "manage_users";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    Everyone,
    Authenticated,
    User(Uuid),
    Role(String),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Everyone => f.write_str("system.Everyone"),
            Principal::Authenticated => f.write_str("system.Authenticated"),
            Principal::User(id) => write!(f, "user:{id}"),
            Principal::Role(name) => write!(f, "role:{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permissions {
    All,
    Only(&'static str),
}

impl Permissions {
    fn covers(&self, permission: &str) -> bool {
        match self {
            Permissions::All => true,
            Permissions::Only(name) => *name == permission,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    pub action: Action,
    pub principal: Principal,
    pub permissions: Permissions,
}

/// An ordered access-control list. The first entry matching one of the
/// caller's principals and the requested permission decides; when nothing
/// matches, access is denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    entries: Vec<AclEntry>,
}

impl Acl {
    pub fn new(entries: Vec<AclEntry>) -> Self {
        Self { entries }
    }

    /// Signed-in users get [`AUTHENTICATED`]; admins get everything.
    pub fn root() -> Self {
        Self::new(vec![
            AclEntry {
                action: Action::Allow,
                principal: Principal::Authenticated,
                permissions: Permissions::Only(AUTHENTICATED),
            },
            AclEntry {
                action: Action::Allow,
                principal: Principal::Role("admin".to_string()),
                permissions: Permissions::All,
            },
        ])
    }

    pub fn entries(&self) -> &[AclEntry] {
        &self.entries
    }

    pub fn permits(&self, principals: &[Principal], permission: &str) -> bool {
        self.entries
            .iter()
            .find(|entry| {
                entry.permissions.covers(permission) && principals.contains(&entry.principal)
            })
            .is_some_and(|entry| entry.action == Action::Allow)
    }
}

/// Who is making the request.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user: Option<User>,
    pub roles: Vec<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Everyone, plus for a known user: Authenticated, the user itself and
    /// one principal per role.
    pub fn effective_principals(&self) -> Vec<Principal> {
        let mut principals = vec![Principal::Everyone];
        if let Some(user) = &self.user {
            principals.push(Principal::Authenticated);
            principals.push(Principal::User(user.id));
            principals.extend(self.roles.iter().cloned().map(Principal::Role));
        }
        principals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn identity(roles: &[&str]) -> Identity {
        Identity {
            user: Some(User {
                id: Uuid::new_v4(),
                name: "someone".to_string(),
                email: "someone@example.com".to_string(),
                password_hash: String::new(),
                created_at: Utc::now(),
            }),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn principals_render_like_their_identifiers() {
        let id = Uuid::nil();
        assert_eq!(Principal::Everyone.to_string(), "system.Everyone");
        assert_eq!(Principal::Authenticated.to_string(), "system.Authenticated");
        assert_eq!(Principal::User(id).to_string(), format!("user:{id}"));
        assert_eq!(Principal::Role("admin".into()).to_string(), "role:admin");
    }

    #[test]
    fn anonymous_callers_are_only_everyone() {
        let anonymous = Identity::anonymous();
        assert!(!anonymous.is_authenticated());
        assert_eq!(anonymous.effective_principals(), vec![Principal::Everyone]);

        let acl = Acl::root();
        assert!(!acl.permits(&anonymous.effective_principals(), AUTHENTICATED));
        assert!(!acl.permits(&anonymous.effective_principals(), READ));
    }

    #[test]
    fn plain_users_are_authenticated_but_cannot_read() {
        let user = identity(&[]);
        let principals = user.effective_principals();
        assert!(principals.contains(&Principal::Authenticated));

        let acl = Acl::root();
        assert!(acl.permits(&principals, AUTHENTICATED));
        assert!(!acl.permits(&principals, READ));
        assert!(!acl.permits(&principals, MANAGE_USERS));
    }

    #[test]
    fn admins_hold_every_permission() {
        let admin = identity(&["admin"]);
        let principals = admin.effective_principals();
        assert!(principals.contains(&Principal::Role("admin".into())));

        let acl = Acl::root();
        for permission in [AUTHENTICATED, READ, MANAGE_USERS, "anything"] {
            assert!(acl.permits(&principals, permission), "{permission}");
        }
    }

    #[test]
    fn first_matching_entry_wins() {
        let acl = Acl::new(vec![
            AclEntry {
                action: Action::Deny,
                principal: Principal::Role("suspended".into()),
                permissions: Permissions::All,
            },
            AclEntry {
                action: Action::Allow,
                principal: Principal::Authenticated,
                permissions: Permissions::Only(READ),
            },
        ]);
        assert!(acl.permits(&identity(&[]).effective_principals(), READ));
        assert!(!acl.permits(&identity(&["suspended"]).effective_principals(), READ));
    }
}
