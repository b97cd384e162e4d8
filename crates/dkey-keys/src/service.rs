//! Boundary to the backend key lifecycle service.
//!
//! The engine itself only needs the installed key and its permissions; the
//! rest of this trait is the surface an application wires to its backend.
//! [`MemoryKeyService`] is an in-process implementation for simulation and
//! tests.

use crate::{
    CalibrationRecord, DeviceInfo, DigitalKeyInfo, DigitalKeyStatus, InstalledKey, KeyChangeStatus,
    KeyListFilter, KeyMaterial, KeyRole, KeyStore, OwnerKeyStatus, Page, Permission,
    PermissionScope, ServiceError, ServiceResult, ShareQuota, ShareRequest,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A key downloaded from the backend.
#[derive(Debug, Clone)]
pub struct DownloadedKey {
    /// Key record.
    pub info: DigitalKeyInfo,
    /// Secret material for the handshake.
    pub material: KeyMaterial,
}

/// Backend key lifecycle operations.
///
/// Calls are request/response and keyed by VIN and/or key id.
pub trait KeyLifecycleService {
    /// Activate owner keys for the given vehicles. Returns the new key ids.
    fn activate(&mut self, vins: &[String], auth_token: &str) -> ServiceResult<Vec<String>>;

    /// Download a key to this device.
    fn download(&mut self, vin: &str, dk_id: &str, auth_token: &str)
        -> ServiceResult<DownloadedKey>;

    /// Permissions configurable for a vehicle; `None` lists every scope.
    fn permission_config(
        &mut self,
        vin: &str,
        scope: Option<PermissionScope>,
    ) -> ServiceResult<Vec<Permission>>;

    /// How many more keys the owner may share.
    fn share_amount(&mut self, vin: &str) -> ServiceResult<ShareQuota>;

    /// Share a key with other users.
    fn share(&mut self, vin: &str, request: &ShareRequest) -> ServiceResult<()>;

    /// Revoke a key the owner shared.
    fn revoke_shared(&mut self, vin: &str, dk_id: &str) -> ServiceResult<()>;

    /// Delete keys the owner shared.
    fn delete_shared(&mut self, vin: &str, dk_ids: &[String]) -> ServiceResult<()>;

    /// Owner key status for a vehicle.
    fn owner_status(&mut self, vin: &str) -> ServiceResult<OwnerKeyStatus>;

    /// Keys of non-owners on a vehicle.
    fn non_owner_keys(&mut self, vin: &str, page: Page) -> ServiceResult<Vec<DigitalKeyInfo>>;

    /// Keys others have shared with this user; `None` means every vehicle.
    fn be_shared_keys(
        &mut self,
        vin: Option<&str>,
        filter: KeyListFilter,
        page: Page,
    ) -> ServiceResult<Vec<DigitalKeyInfo>>;

    /// Delete a key someone shared with this user.
    fn delete_be_shared(&mut self, vin: &str, dk_id: &str) -> ServiceResult<()>;

    /// Keys currently authorized by the owner.
    fn authorized_keys(&mut self, vin: &str) -> ServiceResult<Vec<DigitalKeyInfo>>;

    /// Authorization history.
    fn authorized_history(&mut self, vin: &str, page: Page) -> ServiceResult<Vec<DigitalKeyInfo>>;

    /// Other devices bound to the vehicle.
    fn devices(&mut self, vin: &str) -> ServiceResult<Vec<DeviceInfo>>;

    /// Unbind a device.
    fn cancel_device(&mut self, mobile_id: &str, vin: &str) -> ServiceResult<()>;

    /// Deregister the digital key service for a vehicle.
    fn cancel_profession(&mut self, vin: &str, auth_token: &str) -> ServiceResult<()>;

    /// Deliver a push message to the backend for processing.
    fn push_message(&mut self, message: &str, auth_token: &str) -> ServiceResult<()>;

    /// Upload calibration values for a vehicle model.
    fn upload_calibration(&mut self, record: &CalibrationRecord) -> ServiceResult<()>;
}

impl KeyStore {
    /// Download a key and install it.
    pub fn install_from<S: KeyLifecycleService + ?Sized>(
        &mut self,
        service: &mut S,
        vin: &str,
        dk_id: &str,
        auth_token: &str,
    ) -> ServiceResult<()> {
        let downloaded = service.download(vin, dk_id, auth_token)?;
        if downloaded.info.dk_id != dk_id {
            return Err(ServiceError::InvalidResponse(format!(
                "requested key {} but received {}",
                dk_id, downloaded.info.dk_id
            )));
        }
        self.install(InstalledKey::new(downloaded.info, downloaded.material));
        Ok(())
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-process backend holding records in memory.
#[derive(Debug, Default)]
pub struct MemoryKeyService {
    auth_token: String,
    mobile_id: String,
    keys: BTreeMap<String, DownloadedKey>,
    permissions: BTreeMap<String, Vec<Permission>>,
    devices: BTreeMap<String, Vec<DeviceInfo>>,
    history: Vec<DigitalKeyInfo>,
    calibrations: Vec<CalibrationRecord>,
    share_limit: u32,
    next_id: u64,
}

impl MemoryKeyService {
    /// Create a backend accepting `auth_token`, serving device `mobile_id`.
    pub fn new(auth_token: impl Into<String>, mobile_id: impl Into<String>) -> Self {
        MemoryKeyService {
            auth_token: auth_token.into(),
            mobile_id: mobile_id.into(),
            share_limit: 5,
            ..Default::default()
        }
    }

    /// Set the per-vehicle share limit.
    pub fn with_share_limit(mut self, limit: u32) -> Self {
        self.share_limit = limit;
        self
    }

    /// Register a key record with its material.
    pub fn provision(&mut self, info: DigitalKeyInfo, material: KeyMaterial) {
        self.keys
            .insert(info.dk_id.clone(), DownloadedKey { info, material });
    }

    /// Register the permissions offered for a vehicle.
    pub fn set_permissions(&mut self, vin: &str, permissions: Vec<Permission>) {
        self.permissions.insert(vin.to_string(), permissions);
    }

    /// Register a bound device.
    pub fn add_device(&mut self, vin: &str, device: DeviceInfo) {
        self.devices.entry(vin.to_string()).or_default().push(device);
    }

    /// Calibration records uploaded so far.
    pub fn calibrations(&self) -> &[CalibrationRecord] {
        &self.calibrations
    }

    fn check_token(&self, auth_token: &str) -> ServiceResult<()> {
        if auth_token != self.auth_token {
            return Err(ServiceError::Unauthorized);
        }
        Ok(())
    }

    fn key_mut(&mut self, vin: &str, dk_id: &str) -> ServiceResult<&mut DownloadedKey> {
        self.keys
            .get_mut(dk_id)
            .filter(|k| k.info.vin == vin)
            .ok_or_else(|| ServiceError::NotFound(format!("key {} on {}", dk_id, vin)))
    }

    fn infos<'a>(&'a self, vin: &'a str) -> impl Iterator<Item = &'a DigitalKeyInfo> + 'a {
        self.keys.values().map(|k| &k.info).filter(move |i| i.vin == vin)
    }

    fn owner_key(&self, vin: &str) -> Option<&DigitalKeyInfo> {
        self.keys
            .values()
            .map(|k| &k.info)
            .find(|i| i.vin == vin && i.key_type == KeyRole::Owner)
    }

    fn shared_count(&self, vin: &str) -> u32 {
        self.infos(vin)
            .filter(|i| i.key_type != KeyRole::Owner && i.status != DigitalKeyStatus::Revoked)
            .count() as u32
    }
}

impl KeyLifecycleService for MemoryKeyService {
    fn activate(&mut self, vins: &[String], auth_token: &str) -> ServiceResult<Vec<String>> {
        self.check_token(auth_token)?;
        let mut ids = Vec::with_capacity(vins.len());
        for vin in vins {
            let key = self
                .keys
                .values_mut()
                .find(|k| &k.info.vin == vin && k.info.key_type == KeyRole::Owner)
                .ok_or_else(|| ServiceError::NotFound(format!("owner key on {}", vin)))?;
            if key.info.status == DigitalKeyStatus::NonActivated {
                key.info.status = DigitalKeyStatus::NonDownload;
            }
            info!(vin = %vin, dk_id = %key.info.dk_id, "activated owner key");
            ids.push(key.info.dk_id.clone());
        }
        Ok(ids)
    }

    fn download(
        &mut self,
        vin: &str,
        dk_id: &str,
        auth_token: &str,
    ) -> ServiceResult<DownloadedKey> {
        self.check_token(auth_token)?;
        let mobile_id = self.mobile_id.clone();
        let key = self.key_mut(vin, dk_id)?;
        match key.info.status {
            DigitalKeyStatus::NonActivated => {
                return Err(ServiceError::Rejected {
                    code: 1001,
                    message: "key not activated".to_string(),
                })
            }
            DigitalKeyStatus::Revoked | DigitalKeyStatus::Expired | DigitalKeyStatus::Frozen => {
                return Err(ServiceError::Rejected {
                    code: 1002,
                    message: format!("key is {:?}", key.info.status),
                })
            }
            _ => {}
        }
        key.info.status = DigitalKeyStatus::Normal;
        key.info.is_download = true;
        key.info.mobile_id = mobile_id;
        debug!(vin, dk_id, "key downloaded");
        Ok(key.clone())
    }

    fn permission_config(
        &mut self,
        vin: &str,
        scope: Option<PermissionScope>,
    ) -> ServiceResult<Vec<Permission>> {
        let all = self
            .permissions
            .get(vin)
            .ok_or_else(|| ServiceError::NotFound(format!("vehicle {}", vin)))?;
        Ok(all
            .iter()
            .filter(|p| scope.map_or(true, |s| p.permission_type == s))
            .cloned()
            .collect())
    }

    fn share_amount(&mut self, vin: &str) -> ServiceResult<ShareQuota> {
        let used = self.shared_count(vin);
        Ok(ShareQuota {
            max_amount: self.share_limit,
            use_amount: used,
            available: self.share_limit.saturating_sub(used),
        })
    }

    fn share(&mut self, vin: &str, request: &ShareRequest) -> ServiceResult<()> {
        if request.key_type == KeyRole::Owner {
            return Err(ServiceError::Rejected {
                code: 2001,
                message: "owner keys cannot be shared".to_string(),
            });
        }
        let owner = self
            .owner_key(vin)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("owner key on {}", vin)))?;
        let available = self.share_limit.saturating_sub(self.shared_count(vin));
        if request.recipients.len() as u32 > available {
            return Err(ServiceError::Rejected {
                code: 2002,
                message: format!("share quota exceeded ({} available)", available),
            });
        }

        for recipient in &request.recipients {
            self.next_id += 1;
            let info = DigitalKeyInfo {
                dk_id: format!("{}-s{}", owner.dk_id, self.next_id),
                phone_number: recipient.clone(),
                start_time: request.start_time.clone(),
                end_time: request.end_time.clone(),
                key_type: request.key_type,
                permission_list: request.permissions.clone(),
                times: request.times,
                vin: vin.to_string(),
                user_id: owner.user_id.clone(),
                status: DigitalKeyStatus::NonDownload,
                ..Default::default()
            };
            self.history.push(info.clone());
            // Recipient material is issued out of band; replace it with `provision`.
            self.provision(info, KeyMaterial::new([0u8; 32], [0u8; 32]));
        }
        Ok(())
    }

    fn revoke_shared(&mut self, vin: &str, dk_id: &str) -> ServiceResult<()> {
        let key = self.key_mut(vin, dk_id)?;
        key.info.status = DigitalKeyStatus::Revoked;
        key.info.change_status = KeyChangeStatus::Normal;
        Ok(())
    }

    fn delete_shared(&mut self, vin: &str, dk_ids: &[String]) -> ServiceResult<()> {
        for dk_id in dk_ids {
            self.key_mut(vin, dk_id)?;
            self.keys.remove(dk_id);
        }
        Ok(())
    }

    fn owner_status(&mut self, vin: &str) -> ServiceResult<OwnerKeyStatus> {
        let owner = self
            .owner_key(vin)
            .ok_or_else(|| ServiceError::NotFound(format!("owner key on {}", vin)))?;
        Ok(OwnerKeyStatus {
            status: owner.status,
            dk_id: owner.dk_id.clone(),
        })
    }

    fn non_owner_keys(&mut self, vin: &str, page: Page) -> ServiceResult<Vec<DigitalKeyInfo>> {
        let keys: Vec<_> = self
            .infos(vin)
            .filter(|i| i.key_type != KeyRole::Owner)
            .cloned()
            .collect();
        Ok(page.slice(&keys))
    }

    fn be_shared_keys(
        &mut self,
        vin: Option<&str>,
        filter: KeyListFilter,
        page: Page,
    ) -> ServiceResult<Vec<DigitalKeyInfo>> {
        let keys: Vec<_> = self
            .keys
            .values()
            .map(|k| &k.info)
            .filter(|i| i.key_type != KeyRole::Owner)
            .filter(|i| vin.map_or(true, |v| i.vin == v))
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        Ok(page.slice(&keys))
    }

    fn delete_be_shared(&mut self, vin: &str, dk_id: &str) -> ServiceResult<()> {
        let key = self.key_mut(vin, dk_id)?;
        key.info.change_status = KeyChangeStatus::Deleted;
        key.info.status = DigitalKeyStatus::Revoked;
        Ok(())
    }

    fn authorized_keys(&mut self, vin: &str) -> ServiceResult<Vec<DigitalKeyInfo>> {
        Ok(self
            .infos(vin)
            .filter(|i| i.key_type != KeyRole::Owner && i.status != DigitalKeyStatus::Revoked)
            .cloned()
            .collect())
    }

    fn authorized_history(&mut self, vin: &str, page: Page) -> ServiceResult<Vec<DigitalKeyInfo>> {
        let history: Vec<_> = self.history.iter().filter(|i| i.vin == vin).cloned().collect();
        Ok(page.slice(&history))
    }

    fn devices(&mut self, vin: &str) -> ServiceResult<Vec<DeviceInfo>> {
        Ok(self
            .devices
            .get(vin)
            .map(|d| {
                d.iter()
                    .filter(|d| d.mobile_id != self.mobile_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn cancel_device(&mut self, mobile_id: &str, vin: &str) -> ServiceResult<()> {
        let devices = self
            .devices
            .get_mut(vin)
            .ok_or_else(|| ServiceError::NotFound(format!("vehicle {}", vin)))?;
        let before = devices.len();
        devices.retain(|d| d.mobile_id != mobile_id);
        if devices.len() == before {
            return Err(ServiceError::NotFound(format!("device {}", mobile_id)));
        }
        Ok(())
    }

    fn cancel_profession(&mut self, vin: &str, auth_token: &str) -> ServiceResult<()> {
        self.check_token(auth_token)?;
        self.keys.retain(|_, k| k.info.vin != vin);
        self.devices.remove(vin);
        info!(vin, "digital key service cancelled");
        Ok(())
    }

    fn push_message(&mut self, message: &str, auth_token: &str) -> ServiceResult<()> {
        self.check_token(auth_token)?;
        debug!(len = message.len(), "push message accepted");
        Ok(())
    }

    fn upload_calibration(&mut self, record: &CalibrationRecord) -> ServiceResult<()> {
        if record.pe.is_empty() || record.ps.is_empty() {
            return Err(ServiceError::Rejected {
                code: 3001,
                message: "both PE and PS values are required".to_string(),
            });
        }
        self.calibrations.push(record.clone());
        Ok(())
    }
}
