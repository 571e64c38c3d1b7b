//! Reserved class parameters
//!
//! Class parameters under [`PARAMETER_PREFIX`] are consumed by the operator
//! and never forwarded to the backend. Only the secret name and namespace
//! suffixes are recognised.

use k8s_openapi::api::core::v1::{Secret, SecretReference};
use k8s_openapi::api::storage::v1::StorageClass;
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Prefix reserved for operator-consumed parameters
pub const PARAMETER_PREFIX: &str = "volumegroup.storage.openshift.io/";

pub const SECRET_NAME_SUFFIX: &str = "secret-name";
pub const SECRET_NAMESPACE_SUFFIX: &str = "secret-namespace";

/// StorageClass parameter marking its claims as grouped by the driver itself
pub const STATIC_GROUP_PARAMETER: &str = "volume_group";

fn secret_name_key() -> String {
    format!("{}{}", PARAMETER_PREFIX, SECRET_NAME_SUFFIX)
}

fn secret_namespace_key() -> String {
    format!("{}{}", PARAMETER_PREFIX, SECRET_NAMESPACE_SUFFIX)
}

/// Check every prefixed key has a known suffix and a non-empty value
pub fn validate_prefixed_parameters(parameters: &BTreeMap<String, String>) -> Result<()> {
    for (key, value) in parameters {
        let Some(suffix) = key.strip_prefix(PARAMETER_PREFIX) else {
            continue;
        };
        match suffix {
            SECRET_NAME_SUFFIX | SECRET_NAMESPACE_SUFFIX => {
                if value.is_empty() {
                    return Err(Error::InvalidParameter {
                        key: key.clone(),
                        reason: "value must not be empty".into(),
                    });
                }
            }
            _ => {
                return Err(Error::InvalidParameter {
                    key: key.clone(),
                    reason: format!("unknown key under reserved prefix {}", PARAMETER_PREFIX),
                });
            }
        }
    }
    Ok(())
}

/// Parameters with every reserved key removed
pub fn filter_prefixed_parameters(parameters: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    parameters
        .iter()
        .filter(|(key, _)| !key.starts_with(PARAMETER_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Secret named by the reserved parameters, when both keys are set
pub fn secret_reference(parameters: &BTreeMap<String, String>) -> Option<SecretReference> {
    let name = parameters.get(&secret_name_key()).filter(|v| !v.is_empty())?;
    let namespace = parameters
        .get(&secret_namespace_key())
        .filter(|v| !v.is_empty())?;
    Some(SecretReference {
        name: Some(name.clone()),
        namespace: Some(namespace.clone()),
    })
}

/// Flatten a Secret into the string map handed to the backend
pub fn secret_data(secret: &Secret) -> BTreeMap<String, String> {
    let mut data: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    if let Some(string_data) = &secret.string_data {
        data.extend(string_data.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    data
}

/// True when the StorageClass already asks the driver to group its volumes
pub fn is_statically_grouped(storage_class: &StorageClass) -> bool {
    storage_class
        .parameters
        .as_ref()
        .map_or(false, |p| p.contains_key(STATIC_GROUP_PARAMETER))
}
