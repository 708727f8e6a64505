//! SQL persistence for VPN peers, certificates, accounts, and live
//! connections.

use crate::vpn::error::{VpnError, VpnResult};
use crate::vpn::types::*;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct VpnStore {
    pool: SqlitePool,
}

fn map_unique(e: sqlx::Error, what: &str) -> VpnError {
    match &e {
        sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
            VpnError::conflict(format!("{} already exists", what))
        }
        _ => e.into(),
    }
}

impl VpnStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> VpnResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS wg_peers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                principal TEXT,
                public_key TEXT NOT NULL UNIQUE,
                allowed_ips TEXT NOT NULL,
                preshared_key TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ovpn_certs (
                id TEXT PRIMARY KEY,
                common_name TEXT NOT NULL UNIQUE,
                serial TEXT NOT NULL,
                not_after INTEGER NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chap_accounts (
                id TEXT PRIMARY KEY,
                protocol TEXT NOT NULL,
                username TEXT NOT NULL,
                secret TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                UNIQUE (protocol, username)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vpn_connections (
                id TEXT PRIMARY KEY,
                principal TEXT,
                protocol TEXT NOT NULL,
                client_ip TEXT NOT NULL,
                connected_at INTEGER NOT NULL,
                disconnected_at INTEGER,
                bytes_rx INTEGER NOT NULL DEFAULT 0,
                bytes_tx INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── WireGuard peers ──────────────────────────────────────────────

    pub async fn insert_peer(&self, peer: &WireGuardPeer) -> VpnResult<()> {
        sqlx::query(
            "INSERT INTO wg_peers
                (id, name, principal, public_key, allowed_ips, preshared_key, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&peer.id)
        .bind(&peer.name)
        .bind(&peer.principal)
        .bind(&peer.public_key)
        .bind(&peer.allowed_ips)
        .bind(&peer.preshared_key)
        .bind(peer.enabled as i64)
        .bind(peer.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "Peer public key"))?;
        Ok(())
    }

    pub async fn get_peer(&self, id: &str) -> VpnResult<Option<WireGuardPeer>> {
        let row = sqlx::query("SELECT * FROM wg_peers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_peer))
    }

    pub async fn list_peers(&self) -> VpnResult<Vec<WireGuardPeer>> {
        let rows = sqlx::query("SELECT * FROM wg_peers ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_peer).collect())
    }

    pub async fn set_peer_enabled(&self, id: &str, enabled: bool) -> VpnResult<()> {
        let done = sqlx::query("UPDATE wg_peers SET enabled = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(VpnError::not_found(format!("Peer {} not found", id)));
        }
        Ok(())
    }

    pub async fn delete_peer(&self, id: &str) -> VpnResult<WireGuardPeer> {
        let peer = self
            .get_peer(id)
            .await?
            .ok_or_else(|| VpnError::not_found(format!("Peer {} not found", id)))?;
        sqlx::query("DELETE FROM wg_peers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(peer)
    }

    // ── OpenVPN certificates ─────────────────────────────────────────

    pub async fn insert_cert(&self, cert: &OpenVpnCert) -> VpnResult<()> {
        sqlx::query(
            "INSERT INTO ovpn_certs (id, common_name, serial, not_after, revoked, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&cert.id)
        .bind(&cert.common_name)
        .bind(&cert.serial)
        .bind(cert.not_after)
        .bind(cert.revoked as i64)
        .bind(cert.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "Certificate common name"))?;
        Ok(())
    }

    pub async fn get_cert(&self, id: &str) -> VpnResult<Option<OpenVpnCert>> {
        let row = sqlx::query("SELECT * FROM ovpn_certs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_cert))
    }

    pub async fn list_certs(&self) -> VpnResult<Vec<OpenVpnCert>> {
        let rows = sqlx::query("SELECT * FROM ovpn_certs ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_cert).collect())
    }

    /// Flip to revoked; only one caller wins.
    pub async fn revoke_cert(&self, id: &str) -> VpnResult<OpenVpnCert> {
        let done = sqlx::query("UPDATE ovpn_certs SET revoked = 1 WHERE id = ? AND revoked = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(VpnError::not_found(format!(
                "Certificate {} not found or already revoked",
                id
            )));
        }
        self.get_cert(id)
            .await?
            .ok_or_else(|| VpnError::database("Revoked certificate vanished"))
    }

    // ── Chap accounts ────────────────────────────────────────────────

    pub async fn insert_account(&self, account: &ChapAccount) -> VpnResult<()> {
        sqlx::query(
            "INSERT INTO chap_accounts (id, protocol, username, secret, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.id)
        .bind(account.protocol.as_str())
        .bind(&account.username)
        .bind(&account.secret)
        .bind(account.enabled as i64)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "Account username"))?;
        Ok(())
    }

    pub async fn list_accounts(&self, protocol: VpnProtocol) -> VpnResult<Vec<ChapAccount>> {
        let rows = sqlx::query(
            "SELECT * FROM chap_accounts WHERE protocol = ? ORDER BY created_at, id",
        )
        .bind(protocol.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_account).collect())
    }

    pub async fn set_account_enabled(&self, id: &str, enabled: bool) -> VpnResult<()> {
        let done = sqlx::query("UPDATE chap_accounts SET enabled = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(VpnError::not_found(format!("Account {} not found", id)));
        }
        Ok(())
    }

    pub async fn delete_account(&self, id: &str) -> VpnResult<ChapAccount> {
        let row = sqlx::query("SELECT * FROM chap_accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let account = row
            .as_ref()
            .map(row_to_account)
            .ok_or_else(|| VpnError::not_found(format!("Account {} not found", id)))?;
        sqlx::query("DELETE FROM chap_accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(account)
    }

    // ── Live connections ─────────────────────────────────────────────

    pub async fn open_connection(&self, connection: &VpnConnection) -> VpnResult<()> {
        sqlx::query(
            "INSERT INTO vpn_connections
                (id, principal, protocol, client_ip, connected_at, bytes_rx, bytes_tx)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&connection.id)
        .bind(&connection.principal)
        .bind(connection.protocol.as_str())
        .bind(&connection.client_ip)
        .bind(connection.connected_at)
        .bind(connection.bytes_rx)
        .bind(connection.bytes_tx)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Byte counters only move forward while the row is open.
    pub async fn update_connection_bytes(
        &self,
        id: &str,
        bytes_rx: i64,
        bytes_tx: i64,
    ) -> VpnResult<()> {
        sqlx::query(
            "UPDATE vpn_connections
             SET bytes_rx = MAX(bytes_rx, ?), bytes_tx = MAX(bytes_tx, ?)
             WHERE id = ? AND disconnected_at IS NULL",
        )
        .bind(bytes_rx)
        .bind(bytes_tx)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close_connection(&self, id: &str, now_ms: i64) -> VpnResult<bool> {
        let done = sqlx::query(
            "UPDATE vpn_connections SET disconnected_at = ? WHERE id = ? AND disconnected_at IS NULL",
        )
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn list_connections(
        &self,
        protocol: Option<VpnProtocol>,
        active_only: bool,
    ) -> VpnResult<Vec<VpnConnection>> {
        let mut sql = String::from("SELECT * FROM vpn_connections WHERE 1 = 1");
        if protocol.is_some() {
            sql.push_str(" AND protocol = ?");
        }
        if active_only {
            sql.push_str(" AND disconnected_at IS NULL");
        }
        sql.push_str(" ORDER BY connected_at DESC, id DESC");
        let mut query = sqlx::query(&sql);
        if let Some(protocol) = protocol {
            query = query.bind(protocol.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_connection).collect())
    }
}

fn row_to_peer(row: &SqliteRow) -> WireGuardPeer {
    WireGuardPeer {
        id: row.get("id"),
        name: row.get("name"),
        principal: row.get("principal"),
        public_key: row.get("public_key"),
        allowed_ips: row.get("allowed_ips"),
        preshared_key: row.get("preshared_key"),
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at: row.get("created_at"),
    }
}

fn row_to_cert(row: &SqliteRow) -> OpenVpnCert {
    OpenVpnCert {
        id: row.get("id"),
        common_name: row.get("common_name"),
        serial: row.get("serial"),
        not_after: row.get("not_after"),
        revoked: row.get::<i64, _>("revoked") != 0,
        created_at: row.get("created_at"),
    }
}

fn row_to_account(row: &SqliteRow) -> ChapAccount {
    ChapAccount {
        id: row.get("id"),
        protocol: VpnProtocol::parse(&row.get::<String, _>("protocol"))
            .unwrap_or(VpnProtocol::Pptp),
        username: row.get("username"),
        secret: row.get("secret"),
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at: row.get("created_at"),
    }
}

fn row_to_connection(row: &SqliteRow) -> VpnConnection {
    VpnConnection {
        id: row.get("id"),
        principal: row.get("principal"),
        protocol: VpnProtocol::parse(&row.get::<String, _>("protocol"))
            .unwrap_or(VpnProtocol::WireGuard),
        client_ip: row.get("client_ip"),
        connected_at: row.get("connected_at"),
        disconnected_at: row.get("disconnected_at"),
        bytes_rx: row.get("bytes_rx"),
        bytes_tx: row.get("bytes_tx"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::error::VpnErrorKind;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> VpnStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let s = VpnStore::new(pool);
        s.ensure_schema().await.unwrap();
        s
    }

    fn peer(public_key: &str) -> WireGuardPeer {
        WireGuardPeer {
            id: quay_core::new_id(),
            name: "laptop".into(),
            principal: Some("alice".into()),
            public_key: public_key.into(),
            allowed_ips: "10.8.0.2/32".into(),
            preshared_key: None,
            enabled: true,
            created_at: 1000,
        }
    }

    #[tokio::test]
    async fn peer_public_key_unique() {
        let s = store().await;
        s.insert_peer(&peer("pk-1")).await.unwrap();
        let err = s.insert_peer(&peer("pk-1")).await.unwrap_err();
        assert_eq!(err.kind, VpnErrorKind::Conflict);
        s.insert_peer(&peer("pk-2")).await.unwrap();
        assert_eq!(s.list_peers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn peer_enable_disable_delete() {
        let s = store().await;
        let p = peer("pk-1");
        s.insert_peer(&p).await.unwrap();
        s.set_peer_enabled(&p.id, false).await.unwrap();
        assert!(!s.get_peer(&p.id).await.unwrap().unwrap().enabled);
        let removed = s.delete_peer(&p.id).await.unwrap();
        assert_eq!(removed.public_key, "pk-1");
        assert!(s.get_peer(&p.id).await.unwrap().is_none());
        let err = s.delete_peer(&p.id).await.unwrap_err();
        assert_eq!(err.kind, VpnErrorKind::NotFound);
    }

    #[tokio::test]
    async fn cert_common_name_unique_and_revocation_single_shot() {
        let s = store().await;
        let cert = OpenVpnCert {
            id: quay_core::new_id(),
            common_name: "carol-laptop".into(),
            serial: "0a1b".into(),
            not_after: 9_999_999,
            revoked: false,
            created_at: 100,
        };
        s.insert_cert(&cert).await.unwrap();
        let mut dup = cert.clone();
        dup.id = quay_core::new_id();
        assert_eq!(
            s.insert_cert(&dup).await.unwrap_err().kind,
            VpnErrorKind::Conflict
        );
        let revoked = s.revoke_cert(&cert.id).await.unwrap();
        assert!(revoked.revoked);
        assert_eq!(
            s.revoke_cert(&cert.id).await.unwrap_err().kind,
            VpnErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn chap_accounts_unique_per_protocol() {
        let s = store().await;
        let account = |protocol: VpnProtocol| ChapAccount {
            id: quay_core::new_id(),
            protocol,
            username: "roaduser".into(),
            secret: "s".into(),
            enabled: true,
            created_at: 0,
        };
        s.insert_account(&account(VpnProtocol::Pptp)).await.unwrap();
        // Same username on the other protocol is fine.
        s.insert_account(&account(VpnProtocol::L2tp)).await.unwrap();
        assert_eq!(
            s.insert_account(&account(VpnProtocol::Pptp))
                .await
                .unwrap_err()
                .kind,
            VpnErrorKind::Conflict
        );
        assert_eq!(s.list_accounts(VpnProtocol::Pptp).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn connection_lifecycle_and_monotonic_bytes() {
        let s = store().await;
        let conn = VpnConnection {
            id: "c1".into(),
            principal: Some("alice".into()),
            protocol: VpnProtocol::WireGuard,
            client_ip: "198.51.100.4".into(),
            connected_at: 1000,
            disconnected_at: None,
            bytes_rx: 0,
            bytes_tx: 0,
        };
        s.open_connection(&conn).await.unwrap();
        s.update_connection_bytes("c1", 500, 700).await.unwrap();
        // A stale sample cannot move counters backwards.
        s.update_connection_bytes("c1", 400, 600).await.unwrap();
        let active = s.list_connections(None, true).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].bytes_rx, 500);
        assert_eq!(active[0].bytes_tx, 700);

        assert!(s.close_connection("c1", 2000).await.unwrap());
        assert!(!s.close_connection("c1", 2000).await.unwrap());
        assert!(s.list_connections(None, true).await.unwrap().is_empty());
        let all = s
            .list_connections(Some(VpnProtocol::WireGuard), false)
            .await
            .unwrap();
        assert_eq!(all[0].disconnected_at, Some(2000));
        // Counters frozen after close.
        s.update_connection_bytes("c1", 9000, 9000).await.unwrap();
        let all = s.list_connections(None, false).await.unwrap();
        assert_eq!(all[0].bytes_rx, 500);
    }
}
