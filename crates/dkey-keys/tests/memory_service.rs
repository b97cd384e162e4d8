//! Key lifecycle flows against the in-memory backend.

use dkey_frame::PermissionMask;
use dkey_keys::*;

const TOKEN: &str = "token-1";
const VIN: &str = "LSVAU2180N2183294";

fn near(mask: &str) -> Permission {
    Permission {
        permission_mask: mask.to_string(),
        permission_description: String::new(),
        permission_type: PermissionScope::Near,
        is_choice: true,
    }
}

fn backend() -> MemoryKeyService {
    let mut service = MemoryKeyService::new(TOKEN, "this-phone").with_share_limit(2);
    service.provision(
        DigitalKeyInfo {
            dk_id: "owner-1".to_string(),
            vin: VIN.to_string(),
            key_type: KeyRole::Owner,
            permission_list: vec![near("0x0F")],
            status: DigitalKeyStatus::NonActivated,
            ..Default::default()
        },
        KeyMaterial::new([3; 32], [4; 32]),
    );
    service.set_permissions(
        VIN,
        vec![
            near("0x01"),
            Permission {
                permission_mask: "0x80".to_string(),
                permission_description: "remote start".to_string(),
                permission_type: PermissionScope::Remote,
                is_choice: false,
            },
        ],
    );
    service
}

#[test]
fn test_activate_download_install() {
    let mut service = backend();
    let mut store = KeyStore::new();

    let err = store.install_from(&mut service, VIN, "owner-1", TOKEN).unwrap_err();
    assert!(matches!(err, ServiceError::Rejected { .. }));

    let ids = service.activate(&[VIN.to_string()], TOKEN).unwrap();
    assert_eq!(ids, vec!["owner-1".to_string()]);

    store.install_from(&mut service, VIN, "owner-1", TOKEN).unwrap();
    assert!(store.set_current("owner-1"));

    let current = store.current().unwrap();
    assert_eq!(current.info.status, DigitalKeyStatus::Normal);
    assert_eq!(current.info.mobile_id, "this-phone");
    assert!(current.permits(&PermissionMask::parse_hex("0x01").unwrap()));
    assert_eq!(current.material.vehicle_public_key(), &[4; 32]);
}

#[test]
fn test_bad_token_is_unauthorized() {
    let mut service = backend();
    assert!(matches!(
        service.download(VIN, "owner-1", "wrong"),
        Err(ServiceError::Unauthorized)
    ));
}

#[test]
fn test_share_quota_and_revoke() {
    let mut service = backend();
    let request = ShareRequest {
        permissions: vec![near("0x01")],
        start_time: "2024-01-01 00:00:00".to_string(),
        end_time: "2024-02-01 00:00:00".to_string(),
        key_type: KeyRole::Family,
        times: 3,
        recipients: vec!["13800000000".to_string(), "13900000000".to_string()],
    };
    service.share(VIN, &request).unwrap();

    let quota = service.share_amount(VIN).unwrap();
    assert_eq!(quota.use_amount, 2);
    assert_eq!(quota.available, 0);
    assert!(matches!(
        service.share(VIN, &request),
        Err(ServiceError::Rejected { .. })
    ));

    let shared = service.non_owner_keys(VIN, Page::first(10)).unwrap();
    assert_eq!(shared.len(), 2);

    service.revoke_shared(VIN, &shared[0].dk_id).unwrap();
    assert_eq!(service.authorized_keys(VIN).unwrap().len(), 1);
    assert_eq!(service.share_amount(VIN).unwrap().available, 1);

    let invalid = service
        .be_shared_keys(Some(VIN), KeyListFilter::Invalid, Page::first(10))
        .unwrap();
    assert_eq!(invalid.len(), 1);
    assert_eq!(service.authorized_history(VIN, Page::first(10)).unwrap().len(), 2);
}

#[test]
fn test_permission_config_scope() {
    let mut service = backend();
    assert_eq!(service.permission_config(VIN, None).unwrap().len(), 2);
    let near_only = service
        .permission_config(VIN, Some(PermissionScope::Near))
        .unwrap();
    assert_eq!(near_only.len(), 1);
    assert!(service.permission_config("other", None).is_err());
}

#[test]
fn test_devices_exclude_this_phone() {
    let mut service = backend();
    for id in ["this-phone", "tablet"] {
        service.add_device(
            VIN,
            DeviceInfo {
                mobile_id: id.to_string(),
                ..Default::default()
            },
        );
    }
    let devices = service.devices(VIN).unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].mobile_id, "tablet");

    service.cancel_device("tablet", VIN).unwrap();
    assert!(service.devices(VIN).unwrap().is_empty());
    assert!(service.cancel_device("tablet", VIN).is_err());
}

#[test]
fn test_upload_calibration_requires_both_values() {
    let mut service = backend();
    let mut record = CalibrationRecord {
        vehicle_mode_code: "M1".to_string(),
        pe: vec![0x10],
        ps: Vec::new(),
    };
    assert!(service.upload_calibration(&record).is_err());

    record.ps = vec![0x20];
    service.upload_calibration(&record).unwrap();
    assert_eq!(service.calibrations().len(), 1);
}
