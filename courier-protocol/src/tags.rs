use std::collections::BTreeMap;

use crate::item::Extensions;

/// Keys of the flat envelope tags derived from item context.
pub mod tag_keys {
    #![allow(missing_docs)]

    pub const USER_ID: &str = "user.id";
    pub const USER_AUTH_ID: &str = "user.authUserId";
    pub const USER_ACCOUNT_ID: &str = "user.accountId";
    pub const DEVICE_ID: &str = "device.id";
    pub const DEVICE_TYPE: &str = "device.type";
    pub const DEVICE_MODEL: &str = "device.model";
    pub const SESSION_ID: &str = "session.id";
    pub const OPERATION_ID: &str = "operation.id";
    pub const OPERATION_PARENT_ID: &str = "operation.parentId";
    pub const OPERATION_NAME: &str = "operation.name";
    pub const CLOUD_ROLE: &str = "cloud.role";
    pub const CLOUD_ROLE_INSTANCE: &str = "cloud.roleInstance";
    pub const SDK_VERSION: &str = "internal.sdkVersion";
}

/// Maps the structured context of an item onto flat envelope tags.
///
/// Only present values are written. Existing tags with the same key are overwritten.
pub fn extension_tags(ext: &Extensions, tags: &mut BTreeMap<String, String>) {
    let mut set = |key: &str, value: &Option<String>| {
        if let Some(value) = value {
            tags.insert(key.to_owned(), value.clone());
        }
    };

    if let Some(ref user) = ext.user {
        set(tag_keys::USER_ID, &user.id);
        set(tag_keys::USER_AUTH_ID, &user.auth_id);
        set(tag_keys::USER_ACCOUNT_ID, &user.account_id);
    }

    if let Some(ref device) = ext.device {
        set(tag_keys::DEVICE_ID, &device.id);
        set(tag_keys::DEVICE_TYPE, &device.device_class);
        set(tag_keys::DEVICE_MODEL, &device.model);
    }

    if let Some(ref app) = ext.app {
        set(tag_keys::SESSION_ID, &app.session_id);
    }

    if let Some(ref trace) = ext.trace {
        set(tag_keys::OPERATION_ID, &trace.trace_id);
        set(tag_keys::OPERATION_PARENT_ID, &trace.parent_id);
        set(tag_keys::OPERATION_NAME, &trace.name);
    }

    if let Some(ref cloud) = ext.cloud {
        set(tag_keys::CLOUD_ROLE, &cloud.role);
        set(tag_keys::CLOUD_ROLE_INSTANCE, &cloud.role_instance);
    }

    if let Some(ref sdk) = ext.sdk {
        set(tag_keys::SDK_VERSION, &sdk.ver);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{DeviceExt, TraceExt, UserExt};

    #[test]
    fn test_extension_tags() {
        let ext = Extensions {
            user: Some(UserExt {
                id: Some("u1".to_owned()),
                ..Default::default()
            }),
            device: Some(DeviceExt {
                device_class: Some("Browser".to_owned()),
                ..Default::default()
            }),
            trace: Some(TraceExt {
                trace_id: Some("op".to_owned()),
                name: Some("GET /".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut tags = BTreeMap::new();
        extension_tags(&ext, &mut tags);

        similar_asserts::assert_eq!(
            tags.into_iter().collect::<Vec<_>>(),
            vec![
                ("device.type".to_owned(), "Browser".to_owned()),
                ("operation.id".to_owned(), "op".to_owned()),
                ("operation.name".to_owned(), "GET /".to_owned()),
                ("user.id".to_owned(), "u1".to_owned()),
            ]
        );
    }
}
