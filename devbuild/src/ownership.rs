use log::{info, warn};
use std::fmt;

use crate::{
    error::Result,
    logger::ProjectLogger,
    models::ExecSpec,
    services::ContainerBackend,
};

/// Remaps `$REMOTE_USER` to `$NEW_UID:$NEW_GID` and chowns its home. Refuses
/// to take a UID owned by another account, and keeps the current GID when the
/// requested one already names another group. Must run as root.
///
/// `$PASSWD_FILE` and `$GROUP_FILE` default to the system account databases.
pub const UPDATE_UID_GID_SCRIPT: &str = r#"passwd_file="${PASSWD_FILE:-/etc/passwd}"
group_file="${GROUP_FILE:-/etc/group}"
entry=$(grep "^${REMOTE_USER}:" "$passwd_file" || true)
if [ -z "$entry" ]; then
    echo "No account named ${REMOTE_USER} in ${passwd_file}."
    exit 0
fi
cur_uid=$(echo "$entry" | cut -d: -f3)
cur_gid=$(echo "$entry" | cut -d: -f4)
home=$(echo "$entry" | cut -d: -f6)
uid_owner=$(awk -F: -v id="$NEW_UID" '$3 == id { print $1; exit }' "$passwd_file")
gid_owner=$(awk -F: -v id="$NEW_GID" '$3 == id { print $1; exit }' "$group_file")
if [ "$cur_uid" = "$NEW_UID" ] && [ "$cur_gid" = "$NEW_GID" ]; then
    echo "${REMOTE_USER} already has ${NEW_UID}:${NEW_GID}."
    exit 0
fi
if [ "$cur_uid" != "$NEW_UID" ] && [ -n "$uid_owner" ]; then
    echo "UID ${NEW_UID} belongs to ${uid_owner}, leaving ${REMOTE_USER} alone."
    exit 0
fi
if [ "$cur_gid" != "$NEW_GID" ] && [ -n "$gid_owner" ]; then
    echo "GID ${NEW_GID} belongs to ${gid_owner}, keeping ${cur_gid}."
    NEW_GID="$cur_gid"
    if [ "$cur_uid" = "$NEW_UID" ]; then
        exit 0
    fi
fi
echo "Changing ${REMOTE_USER} from ${cur_uid}:${cur_gid} to ${NEW_UID}:${NEW_GID}."
sed -i -e "s/^\(${REMOTE_USER}:[^:]*:\)[^:]*:[^:]*/\1${NEW_UID}:${NEW_GID}/" "$passwd_file"
if [ "$cur_gid" != "$NEW_GID" ]; then
    sed -i -e "s/^\([^:]*:[^:]*:\)${cur_gid}:/\1${NEW_GID}:/" "$group_file"
fi
if [ -d "$home" ]; then
    chown -R "${NEW_UID}:${NEW_GID}" "$home"
fi
"#;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipRequest {
    pub remote_user: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    UserMissing {
        user: String,
    },
    Unchanged {
        uid: u32,
        gid: u32,
        /// Set when a GID change was dropped because another group owns it.
        gid_owner: Option<String>,
    },
    UidTaken {
        owner: String,
        uid: u32,
    },
    Update {
        user: String,
        from: (u32, u32),
        to: (u32, u32),
        home: String,
        gid_owner: Option<String>,
    },
}

struct Account<'a> {
    name: &'a str,
    uid: Option<u32>,
    gid: Option<u32>,
    home: &'a str,
}

fn accounts(passwd: &str) -> impl Iterator<Item = Account<'_>> {
    passwd.lines().filter_map(|line| {
        let fields = line.split(':').collect::<Vec<_>>();
        if fields.len() < 6 {
            return None;
        }

        Some(Account {
            name: fields[0],
            uid: fields[2].parse().ok(),
            gid: fields[3].parse().ok(),
            home: fields[5],
        })
    })
}

fn group_owning(group: &str, gid: u32) -> Option<String> {
    group.lines().find_map(|line| {
        let fields = line.split(':').collect::<Vec<_>>();
        match fields.as_slice() {
            [name, _, id, ..] if id.parse() == Ok(gid) => Some(name.to_string()),
            _ => None,
        }
    })
}

impl Reconciliation {
    /// Decides what the ownership procedure will do, given the container's
    /// `/etc/passwd` and `/etc/group`.
    pub fn plan(passwd: &str, group: &str, request: &OwnershipRequest) -> Reconciliation {
        let account = accounts(passwd).find(|account| account.name == request.remote_user);

        let (uid, gid, home) = match account {
            Some(Account {
                uid: Some(uid),
                gid: Some(gid),
                home,
                ..
            }) => (uid, gid, home),
            _ => {
                return Reconciliation::UserMissing {
                    user: request.remote_user.clone(),
                }
            }
        };

        if uid == request.uid && gid == request.gid {
            return Reconciliation::Unchanged {
                uid,
                gid,
                gid_owner: None,
            };
        }

        if uid != request.uid {
            let owner = accounts(passwd).find(|account| account.uid == Some(request.uid));
            if let Some(owner) = owner {
                return Reconciliation::UidTaken {
                    owner: owner.name.to_owned(),
                    uid: request.uid,
                };
            }
        }

        let gid_owner = if gid != request.gid {
            group_owning(group, request.gid)
        } else {
            None
        };
        let new_gid = if gid_owner.is_some() { gid } else { request.gid };

        if (uid, gid) == (request.uid, new_gid) {
            return Reconciliation::Unchanged {
                uid,
                gid,
                gid_owner,
            };
        }

        Reconciliation::Update {
            user: request.remote_user.clone(),
            from: (uid, gid),
            to: (request.uid, new_gid),
            home: home.to_owned(),
            gid_owner,
        }
    }

    /// True when the plan declined part of the request because of a conflict.
    pub fn conflicted(&self) -> bool {
        match self {
            Reconciliation::UidTaken { .. } => true,
            Reconciliation::Unchanged { gid_owner, .. } | Reconciliation::Update { gid_owner, .. } => {
                gid_owner.is_some()
            }
            Reconciliation::UserMissing { .. } => false,
        }
    }
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reconciliation::UserMissing { user } => {
                write!(f, "No account named {} in /etc/passwd.", user)
            }
            Reconciliation::Unchanged {
                uid,
                gid,
                gid_owner,
            } => {
                if let Some(owner) = gid_owner {
                    write!(f, "Requested GID belongs to {}. ", owner)?;
                }
                write!(f, "UID and GID already match ({}:{}).", uid, gid)
            }
            Reconciliation::UidTaken { owner, uid } => {
                write!(f, "UID {} belongs to {}, leaving the account alone.", uid, owner)
            }
            Reconciliation::Update {
                user,
                from,
                to,
                home,
                gid_owner,
            } => {
                if let Some(owner) = gid_owner {
                    write!(f, "Requested GID belongs to {}, keeping {}. ", owner, from.1)?;
                }
                write!(
                    f,
                    "Changing {} from {}:{} to {}:{} and chowning {}.",
                    user, from.0, from.1, to.0, to.1, home
                )
            }
        }
    }
}

fn read_file(backend: &mut dyn ContainerBackend, container: &str, path: &str) -> Result<String> {
    let output = backend.exec_sync(container, &ExecSpec::new(vec!["cat", path]).user("root"))?;
    Ok(output.output)
}

/// Reads the account databases from `container`, plans the change, and runs
/// the ownership procedure as root when an update is due.
pub fn reconcile(
    backend: &mut dyn ContainerBackend,
    container: &str,
    request: &OwnershipRequest,
    logger: &ProjectLogger,
) -> Result<Reconciliation> {
    let passwd = read_file(backend, container, "/etc/passwd")?;
    let group = read_file(backend, container, "/etc/group")?;

    let plan = Reconciliation::plan(&passwd, &group, request);
    logger.line(&plan.to_string())?;

    if plan.conflicted() {
        warn!("{}: {}", container, plan);
    }

    if let Reconciliation::Update { user, to, .. } = &plan {
        info!("{}: remapping {} to {}:{}", container, user, to.0, to.1);

        let exec = ExecSpec::new(vec!["sh", "-c", UPDATE_UID_GID_SCRIPT])
            .user("root")
            .env("REMOTE_USER", user)
            .env("NEW_UID", to.0)
            .env("NEW_GID", to.1);
        let output = backend.exec_sync(container, &exec)?;

        for line in output.output.lines() {
            logger.line(line)?;
        }
    }

    Ok(plan)
}
