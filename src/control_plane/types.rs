//! Serde models for the subset of `aws ec2` JSON output we consume.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::{AddressDomain, AttachmentStatus, ElasticAddress, InstanceSnapshot, InstanceState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct RunInstancesOutput {
    #[serde(default)]
    pub(super) instances: Vec<InstanceIdOnly>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct InstanceIdOnly {
    pub(super) instance_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeInstancesOutput {
    #[serde(default)]
    pub(super) reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Reservation {
    #[serde(default)]
    pub(super) instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Instance {
    instance_id: String,
    state: StateName,
    public_dns_name: Option<String>,
    public_ip_address: Option<String>,
    private_dns_name: Option<String>,
    private_ip_address: Option<String>,
    vpc_id: Option<String>,
    subnet_id: Option<String>,
    #[serde(default)]
    network_interfaces: Vec<InterfaceRef>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StateName {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InterfaceRef {
    network_interface_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

/// The CLI reports unassigned DNS names as empty strings.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|inner| !inner.is_empty())
}

impl From<Instance> for InstanceSnapshot {
    fn from(instance: Instance) -> Self {
        Self {
            id: instance.instance_id,
            state: InstanceState::from_name(&instance.state.name),
            public_dns_name: non_empty(instance.public_dns_name),
            public_ip_address: non_empty(instance.public_ip_address),
            private_dns_name: non_empty(instance.private_dns_name),
            private_ip_address: non_empty(instance.private_ip_address),
            vpc_id: non_empty(instance.vpc_id),
            subnet_id: non_empty(instance.subnet_id),
            network_interface_ids: instance
                .network_interfaces
                .into_iter()
                .map(|iface| iface.network_interface_id)
                .collect(),
            tags: instance
                .tags
                .into_iter()
                .map(|tag| (tag.key, tag.value))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeAddressesOutput {
    #[serde(default)]
    pub(super) addresses: Vec<Address>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Address {
    public_ip: String,
    allocation_id: Option<String>,
    domain: Option<String>,
    instance_id: Option<String>,
}

impl From<Address> for ElasticAddress {
    fn from(address: Address) -> Self {
        let domain = match address.domain.as_deref() {
            Some("vpc") => AddressDomain::Vpc,
            _ => AddressDomain::Standard,
        };
        Self {
            public_ip: address.public_ip,
            allocation_id: non_empty(address.allocation_id),
            domain,
            instance_id: non_empty(address.instance_id),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeInterfacesOutput {
    #[serde(default)]
    pub(super) network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct NetworkInterface {
    pub(super) network_interface_id: String,
    attachment: Option<Attachment>,
}

impl NetworkInterface {
    pub(super) fn attachment_status(&self) -> Option<AttachmentStatus> {
        self.attachment
            .as_ref()
            .map(|attachment| AttachmentStatus::from_name(&attachment.status))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Attachment {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct AttachInterfaceOutput {
    pub(super) attachment_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct PasswordDataOutput {
    #[serde(default)]
    pub(super) password_data: String,
}
