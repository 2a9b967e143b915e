//! Who may read which archive.

use async_trait::async_trait;
use jid::{BareJid, Jid};
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::MamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affiliation {
    Owner,
    Admin,
    Member,
    None,
    Outcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Moderator,
    Participant,
    Visitor,
}

/// Room settings relevant to archive access.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomInfo {
    pub jid: BareJid,
    pub members_only: bool,
    /// Only moderators may discover occupants' real JIDs
    pub semi_anonymous: bool,
    pub password_protected: bool,
    /// Messages of this room are logged
    pub logging: bool,
}

/// The host's view of its rooms.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Settings of a local room, `None` when no such room exists.
    async fn room(&self, jid: &BareJid) -> Option<RoomInfo>;

    async fn affiliation(&self, room: &BareJid, user: &BareJid) -> Affiliation;

    /// Role of the occupant joined from `user`, `None` when not in the room.
    async fn occupant_role(&self, room: &BareJid, user: &Jid) -> Option<Role>;
}

/// A host without rooms.
pub struct NoRooms;

#[async_trait]
impl RoomDirectory for NoRooms {
    async fn room(&self, _jid: &BareJid) -> Option<RoomInfo> {
        None
    }

    async fn affiliation(&self, _room: &BareJid, _user: &BareJid) -> Affiliation {
        Affiliation::None
    }

    async fn occupant_role(&self, _room: &BareJid, _user: &Jid) -> Option<Role> {
        None
    }
}

/// Personal archives are readable by their owner and server administrators.
pub fn authorize_personal(
    server: &ServerConfig,
    archive: &BareJid,
    requestor: &Jid,
) -> Result<(), MamError> {
    let requestor = requestor.to_bare();
    if requestor == *archive || server.is_admin(&requestor) {
        return Ok(());
    }
    debug!(%requestor, %archive, "Personal archive access denied");
    Err(MamError::forbidden(Some(format!(
        "You are not allowed to access the archive of '{}'",
        archive
    ))))
}

/// Apply the room's access rules to a query by `requestor`.
pub async fn authorize_room(
    server: &ServerConfig,
    rooms: &dyn RoomDirectory,
    room: &RoomInfo,
    requestor: &Jid,
    with: Option<&Jid>,
) -> Result<(), MamError> {
    let bare = requestor.to_bare();
    let affiliation = rooms.affiliation(&room.jid, &bare).await;

    let admitted = server.is_admin(&bare)
        || match affiliation {
            Affiliation::Outcast => false,
            Affiliation::Owner | Affiliation::Admin | Affiliation::Member => true,
            Affiliation::None => !room.members_only,
        };
    if !admitted {
        debug!(requestor = %bare, room = %room.jid, ?affiliation, "Room archive access denied");
        return Err(MamError::forbidden(Some(format!(
            "You are currently not allowed to access the archive of room '{}'",
            room.jid
        ))));
    }

    let role = rooms.occupant_role(&room.jid, requestor).await;

    if room.semi_anonymous {
        if let Some(with) = with {
            let moderator = role == Some(Role::Moderator);
            if !moderator && with.to_bare() != bare {
                return Err(MamError::forbidden(Some(format!(
                    "You are currently not allowed to filter the archive of room '{}' by JID",
                    room.jid
                ))));
            }
        }
    }

    if room.password_protected && role.is_none() {
        return Err(MamError::forbidden(Some(format!(
            "You must be in room '{}' to access its archive",
            room.jid
        ))));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Directory {
        affiliations: HashMap<String, Affiliation>,
        occupants: HashMap<String, Role>,
    }

    #[async_trait]
    impl RoomDirectory for Directory {
        async fn room(&self, _jid: &BareJid) -> Option<RoomInfo> {
            None
        }

        async fn affiliation(&self, _room: &BareJid, user: &BareJid) -> Affiliation {
            self.affiliations
                .get(user.as_str())
                .copied()
                .unwrap_or(Affiliation::None)
        }

        async fn occupant_role(&self, _room: &BareJid, user: &Jid) -> Option<Role> {
            self.occupants.get(&user.to_string()).copied()
        }
    }

    fn server() -> ServerConfig {
        ServerConfig {
            domain: "capulet.lit".to_string(),
            admins: vec!["admin@capulet.lit".to_string()],
        }
    }

    fn room() -> RoomInfo {
        RoomInfo {
            jid: "lobby@conference.capulet.lit".parse().unwrap(),
            members_only: false,
            semi_anonymous: false,
            password_protected: false,
            logging: true,
        }
    }

    fn directory() -> Directory {
        Directory {
            affiliations: HashMap::from([
                ("tybalt@capulet.lit".to_string(), Affiliation::Outcast),
                ("nurse@capulet.lit".to_string(), Affiliation::Member),
                ("capulet@capulet.lit".to_string(), Affiliation::Owner),
            ]),
            occupants: HashMap::from([
                ("juliet@capulet.lit/balcony".to_string(), Role::Participant),
                ("capulet@capulet.lit/hall".to_string(), Role::Moderator),
            ]),
        }
    }

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    #[test]
    fn test_personal_archive_owner_or_admin() {
        let archive: BareJid = "juliet@capulet.lit".parse().unwrap();
        assert!(authorize_personal(&server(), &archive, &jid("juliet@capulet.lit/balcony")).is_ok());
        assert!(authorize_personal(&server(), &archive, &jid("admin@capulet.lit/desk")).is_ok());
        assert!(authorize_personal(&server(), &archive, &jid("romeo@montague.lit")).is_err());
    }

    #[tokio::test]
    async fn test_outcast_denied() {
        let result = authorize_room(&server(), &directory(), &room(), &jid("tybalt@capulet.lit/x"), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_members_only_requires_membership() {
        let mut info = room();
        info.members_only = true;
        let dir = directory();
        assert!(authorize_room(&server(), &dir, &info, &jid("nurse@capulet.lit/k"), None).await.is_ok());
        assert!(authorize_room(&server(), &dir, &info, &jid("capulet@capulet.lit/hall"), None).await.is_ok());
        assert!(authorize_room(&server(), &dir, &info, &jid("romeo@montague.lit/o"), None).await.is_err());
        assert!(authorize_room(&server(), &dir, &info, &jid("admin@capulet.lit/d"), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_semi_anonymous_with_filter() {
        let mut info = room();
        info.semi_anonymous = true;
        let dir = directory();
        let nurse = jid("nurse@capulet.lit");

        let juliet = jid("juliet@capulet.lit/balcony");
        assert!(authorize_room(&server(), &dir, &info, &juliet, Some(&nurse)).await.is_err());
        assert!(authorize_room(&server(), &dir, &info, &juliet, Some(&jid("juliet@capulet.lit"))).await.is_ok());
        assert!(authorize_room(&server(), &dir, &info, &juliet, None).await.is_ok());

        let moderator = jid("capulet@capulet.lit/hall");
        assert!(authorize_room(&server(), &dir, &info, &moderator, Some(&nurse)).await.is_ok());
    }

    #[tokio::test]
    async fn test_password_protected_requires_presence() {
        let mut info = room();
        info.password_protected = true;
        let dir = directory();
        assert!(authorize_room(&server(), &dir, &info, &jid("juliet@capulet.lit/balcony"), None).await.is_ok());
        assert!(authorize_room(&server(), &dir, &info, &jid("juliet@capulet.lit/other"), None).await.is_err());
    }
}
