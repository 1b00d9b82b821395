//! Directory key layout for the session index.
//!
//! All three services build and parse these keys, so the layout lives here:
//!
//! - `/node/rid/<rid>/uid/<uid>`             -> signal node id
//! - `/media/rid/<rid>/uid/<uid>/mid/<mid>`  -> media descriptor JSON
//! - `/pub/rid/<rid>/uid/<uid>/mid/<mid>`    -> sfu node id

use rand::Rng;
use rand::distr::Alphanumeric;

const MID_SUFFIX_LEN: usize = 6;

/// Key of the signal node entry for a user in a room.
pub fn user_node_key(rid: &str, uid: &str) -> String {
    format!("/node/rid/{rid}/uid/{uid}")
}

/// Prefix under which every user of a room registers its signal node.
pub fn room_node_prefix(rid: &str) -> String {
    format!("/node/rid/{rid}/uid/")
}

/// Key of the media descriptor for one publication.
pub fn media_info_key(rid: &str, uid: &str, mid: &str) -> String {
    format!("/media/rid/{rid}/uid/{uid}/mid/{mid}")
}

/// Prefix of all media descriptors of one user.
pub fn media_info_prefix(rid: &str, uid: &str) -> String {
    format!("/media/rid/{rid}/uid/{uid}/mid/")
}

/// Key of the sfu node entry for one publication. Also the router key on the
/// sfu side.
pub fn media_pub_key(rid: &str, uid: &str, mid: &str) -> String {
    format!("/pub/rid/{rid}/uid/{uid}/mid/{mid}")
}

/// Prefix of all pub entries of one user.
pub fn media_pub_prefix(rid: &str, uid: &str) -> String {
    format!("/pub/rid/{rid}/uid/{uid}/mid/")
}

/// Prefix of all pub entries of a room.
pub fn room_pub_prefix(rid: &str) -> String {
    format!("/pub/rid/{rid}/uid/")
}

/// Split a `/pub/...` or `/media/...` key into `(rid, uid, mid)`.
///
/// Returns `None` for keys that do not follow the layout above.
pub fn parse_media_key(key: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    // "", kind, "rid", <rid>, "uid", <uid>, "mid", <mid>
    if parts.len() != 8 || parts[2] != "rid" || parts[4] != "uid" || parts[6] != "mid" {
        return None;
    }
    Some((
        parts[3].to_string(),
        parts[5].to_string(),
        parts[7].to_string(),
    ))
}

/// Split a `/node/...` key into `(rid, uid)`.
pub fn parse_user_node_key(key: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() != 6 || parts[1] != "node" || parts[2] != "rid" || parts[4] != "uid" {
        return None;
    }
    Some((parts[3].to_string(), parts[5].to_string()))
}

/// The uid a publication or subscription id belongs to (prefix before `#`).
pub fn uid_from_mid(mid: &str) -> &str {
    mid.split('#').next().unwrap_or("")
}

fn rand_suffix() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(MID_SUFFIX_LEN)
        .map(char::from)
        .collect()
}

/// Mint a publication id for a user: `<uid>#<6 alphanumeric chars>`.
pub fn new_mid(uid: &str) -> String {
    format!("{uid}#{}", rand_suffix())
}

/// Mint a subscription id. Same shape as a mid, keyed by the subscriber uid.
pub fn new_sid(suid: &str) -> String {
    format!("{suid}#{}", rand_suffix())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(user_node_key("r1", "alice"), "/node/rid/r1/uid/alice");
        assert_eq!(
            media_info_key("r1", "alice", "alice#a1b2c3"),
            "/media/rid/r1/uid/alice/mid/alice#a1b2c3"
        );
        assert_eq!(
            media_pub_key("r1", "alice", "alice#a1b2c3"),
            "/pub/rid/r1/uid/alice/mid/alice#a1b2c3"
        );
    }

    #[test]
    fn media_key_roundtrip() {
        let key = media_pub_key("r1", "alice", "alice#a1b2c3");
        let (rid, uid, mid) = parse_media_key(&key).unwrap();
        assert_eq!(rid, "r1");
        assert_eq!(uid, "alice");
        assert_eq!(mid, "alice#a1b2c3");
    }

    #[test]
    fn node_key_roundtrip() {
        let key = user_node_key("r1", "alice");
        let (rid, uid) = parse_user_node_key(&key).unwrap();
        assert_eq!(rid, "r1");
        assert_eq!(uid, "alice");
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(parse_media_key("/pub/rid/r1/uid/alice").is_none());
        assert!(parse_media_key("garbage").is_none());
        assert!(parse_user_node_key("/media/rid/r1/uid/alice").is_none());
    }

    #[test]
    fn mid_shape() {
        let mid = new_mid("alice");
        let (prefix, suffix) = mid.split_once('#').unwrap();
        assert_eq!(prefix, "alice");
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(uid_from_mid(&mid), "alice");
    }

    #[test]
    fn uid_from_mid_without_separator() {
        assert_eq!(uid_from_mid("alice"), "alice");
        assert_eq!(uid_from_mid(""), "");
    }
}
