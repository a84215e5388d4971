//! [`ControlPlane`] backend that shells out to the `aws` command-line client.

use std::collections::BTreeMap;
use std::ffi::OsString;

use serde::de::DeserializeOwned;
use tracing::debug;

use super::types::{
    AttachInterfaceOutput, DescribeAddressesOutput, DescribeInstancesOutput,
    DescribeInterfacesOutput, PasswordDataOutput, RunInstancesOutput,
};
use super::{
    AttachmentStatus, ControlPlane, ControlPlaneError, ControlPlaneFuture, ElasticAddress,
    InstanceHandle, InstanceSnapshot, LaunchRequest,
};
use crate::command::{CommandOutput, CommandRunner};

/// Default `aws` CLI binary name.
pub const DEFAULT_AWS_BIN: &str = "aws";

const TRANSIENT_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "ThrottlingException",
    "InternalError",
    "InternalFailure",
    "ServiceUnavailable",
    "Unavailable",
    "IncorrectInstanceState",
    "IncorrectState",
];

/// Connection settings for the `aws` client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AwsCliSettings {
    /// Path or name of the `aws` binary.
    pub program: String,
    /// Region passed as `--region`, when set.
    pub region: Option<String>,
    /// Named profile passed as `--profile`, when set.
    pub profile: Option<String>,
}

impl Default for AwsCliSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_AWS_BIN.to_owned(),
            region: None,
            profile: None,
        }
    }
}

/// Maps a provider error code onto the retry classification.
///
/// Codes ending in `NotFound` mean the resource is not visible yet. Throttling
/// and internal-failure codes are transient. Everything else is a rejection.
#[must_use]
pub fn classify_error_code(operation: &str, code: &str, message: &str) -> ControlPlaneError {
    if code.ends_with("NotFound") {
        return ControlPlaneError::NotFound {
            operation: operation.to_owned(),
            code: code.to_owned(),
        };
    }
    if TRANSIENT_CODES.contains(&code) {
        return ControlPlaneError::Transient {
            operation: operation.to_owned(),
            code: code.to_owned(),
            message: message.to_owned(),
        };
    }
    ControlPlaneError::Rejected {
        operation: operation.to_owned(),
        message: message.to_owned(),
    }
}

/// Extracts `Code` from `An error occurred (Code) when calling ...`.
fn error_code(stderr: &str) -> Option<&str> {
    let (_, rest) = stderr.split_once("An error occurred (")?;
    let (code, _) = rest.split_once(')')?;
    Some(code)
}

/// Drives EC2 through `aws ec2 <command> --output json`.
#[derive(Clone, Debug)]
pub struct AwsCliControlPlane<R: CommandRunner> {
    settings: AwsCliSettings,
    runner: R,
}

impl<R: CommandRunner> AwsCliControlPlane<R> {
    /// Creates a backend using `runner` to execute the client.
    #[must_use]
    pub const fn new(settings: AwsCliSettings, runner: R) -> Self {
        Self { settings, runner }
    }

    fn build_args(&self, command: &str, extra: Vec<OsString>) -> Vec<OsString> {
        let mut args = vec![OsString::from("ec2"), OsString::from(command)];
        args.extend(extra);
        args.push(OsString::from("--output"));
        args.push(OsString::from("json"));
        if let Some(region) = &self.settings.region {
            args.push(OsString::from("--region"));
            args.push(OsString::from(region));
        }
        if let Some(profile) = &self.settings.profile {
            args.push(OsString::from("--profile"));
            args.push(OsString::from(profile));
        }
        args
    }

    fn run(&self, command: &str, extra: Vec<OsString>) -> Result<CommandOutput, ControlPlaneError> {
        let args = self.build_args(command, extra);
        debug!(command, "invoking aws ec2");
        let output = self.runner.run(&self.settings.program, &args)?;
        if output.is_success() {
            return Ok(output);
        }

        let stderr = output.stderr.trim();
        Err(error_code(stderr).map_or_else(
            || ControlPlaneError::Rejected {
                operation: command.to_owned(),
                message: format!(
                    "{} exited with status {}: {stderr}",
                    self.settings.program,
                    output.status_text()
                ),
            },
            |code| classify_error_code(command, code, stderr),
        ))
    }

    fn run_json<T: DeserializeOwned>(
        &self,
        command: &str,
        extra: Vec<OsString>,
    ) -> Result<T, ControlPlaneError> {
        let output = self.run(command, extra)?;
        serde_json::from_str(&output.stdout).map_err(|err| ControlPlaneError::Parse {
            operation: command.to_owned(),
            message: err.to_string(),
        })
    }

    fn launch(&self, request: &LaunchRequest) -> Result<InstanceHandle, ControlPlaneError> {
        let mut extra = vec![
            OsString::from("--image-id"),
            OsString::from(&request.image_id),
            OsString::from("--instance-type"),
            OsString::from(&request.instance_type),
            OsString::from("--count"),
            OsString::from("1"),
            OsString::from("--client-token"),
            OsString::from(uuid::Uuid::new_v4().to_string()),
        ];
        if let Some(key_name) = &request.key_name {
            extra.push(OsString::from("--key-name"));
            extra.push(OsString::from(key_name));
        }
        if let Some(subnet_id) = &request.subnet_id {
            extra.push(OsString::from("--subnet-id"));
            extra.push(OsString::from(subnet_id));
            if request.associate_public_ip {
                extra.push(OsString::from("--associate-public-ip-address"));
            }
        }
        if !request.security_group_ids.is_empty() {
            extra.push(OsString::from("--security-group-ids"));
            extra.extend(request.security_group_ids.iter().map(OsString::from));
        }
        if let Some(private_ip) = &request.private_ip_address {
            extra.push(OsString::from("--private-ip-address"));
            extra.push(OsString::from(private_ip));
        }
        if request.detailed_monitoring {
            extra.push(OsString::from("--monitoring"));
            extra.push(OsString::from("Enabled=true"));
        }

        let response: RunInstancesOutput = self.run_json("run-instances", extra)?;
        response
            .instances
            .into_iter()
            .next()
            .map(|instance| InstanceHandle::new(instance.instance_id))
            .ok_or_else(|| ControlPlaneError::Parse {
                operation: String::from("run-instances"),
                message: String::from("response contained no instances"),
            })
    }

    fn describe(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>, ControlPlaneError> {
        let extra = vec![OsString::from("--instance-ids"), OsString::from(instance_id)];
        let response: DescribeInstancesOutput = match self.run_json("describe-instances", extra) {
            Ok(response) => response,
            Err(ControlPlaneError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(response
            .reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .map(InstanceSnapshot::from)
            .find(|snapshot| snapshot.id == instance_id))
    }

    fn tag(
        &self,
        instance_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ControlPlaneError> {
        let tag_list = tags
            .iter()
            .map(|(key, value)| serde_json::json!({ "Key": key, "Value": value }))
            .collect::<Vec<_>>();
        let encoded =
            serde_json::to_string(&tag_list).map_err(|err| ControlPlaneError::Parse {
                operation: String::from("create-tags"),
                message: err.to_string(),
            })?;
        let extra = vec![
            OsString::from("--resources"),
            OsString::from(instance_id),
            OsString::from("--tags"),
            OsString::from(encoded),
        ];
        self.run("create-tags", extra).map(|_| ())
    }

    fn addresses(&self, public_ip: &str) -> Result<Vec<ElasticAddress>, ControlPlaneError> {
        let extra = vec![OsString::from("--public-ips"), OsString::from(public_ip)];
        match self.run_json::<DescribeAddressesOutput>("describe-addresses", extra) {
            Ok(response) => Ok(response
                .addresses
                .into_iter()
                .map(ElasticAddress::from)
                .collect()),
            Err(ControlPlaneError::NotFound { .. }) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    fn associate(
        &self,
        instance_id: &str,
        address: &ElasticAddress,
    ) -> Result<(), ControlPlaneError> {
        let mut extra = vec![OsString::from("--instance-id"), OsString::from(instance_id)];
        if let Some(allocation_id) = &address.allocation_id {
            extra.push(OsString::from("--allocation-id"));
            extra.push(OsString::from(allocation_id));
        } else {
            extra.push(OsString::from("--public-ip"));
            extra.push(OsString::from(&address.public_ip));
        }
        self.run("associate-address", extra).map(|_| ())
    }

    fn interface_ids(&self, vpc_id: Option<&str>) -> Result<Vec<String>, ControlPlaneError> {
        let extra = vpc_id.map_or_else(Vec::new, |vpc| {
            vec![
                OsString::from("--filters"),
                OsString::from(format!("Name=vpc-id,Values={vpc}")),
            ]
        });
        let response: DescribeInterfacesOutput =
            self.run_json("describe-network-interfaces", extra)?;
        Ok(response
            .network_interfaces
            .into_iter()
            .map(|iface| iface.network_interface_id)
            .collect())
    }

    fn attach(
        &self,
        interface_id: &str,
        instance_id: &str,
        device_index: u32,
    ) -> Result<String, ControlPlaneError> {
        let extra = vec![
            OsString::from("--network-interface-id"),
            OsString::from(interface_id),
            OsString::from("--instance-id"),
            OsString::from(instance_id),
            OsString::from("--device-index"),
            OsString::from(device_index.to_string()),
        ];
        let response: AttachInterfaceOutput = self.run_json("attach-network-interface", extra)?;
        Ok(response.attachment_id)
    }

    fn attachment_status(
        &self,
        interface_id: &str,
    ) -> Result<Option<AttachmentStatus>, ControlPlaneError> {
        let extra = vec![
            OsString::from("--network-interface-ids"),
            OsString::from(interface_id),
        ];
        let response: DescribeInterfacesOutput =
            self.run_json("describe-network-interfaces", extra)?;
        Ok(response
            .network_interfaces
            .iter()
            .find(|iface| iface.network_interface_id == interface_id)
            .and_then(|iface| iface.attachment_status()))
    }

    fn password(&self, instance_id: &str) -> Result<Option<String>, ControlPlaneError> {
        let extra = vec![OsString::from("--instance-id"), OsString::from(instance_id)];
        let response: PasswordDataOutput = self.run_json("get-password-data", extra)?;
        let blob = response.password_data.trim().to_owned();
        Ok(Some(blob).filter(|data| !data.is_empty()))
    }
}

impl<R> ControlPlane for AwsCliControlPlane<R>
where
    R: CommandRunner + Send + Sync,
{
    fn create_instance<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> ControlPlaneFuture<'a, InstanceHandle> {
        Box::pin(async move { self.launch(request) })
    }

    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ControlPlaneFuture<'a, Option<InstanceSnapshot>> {
        Box::pin(async move { self.describe(instance_id) })
    }

    fn create_tags<'a>(
        &'a self,
        instance_id: &'a str,
        tags: &'a BTreeMap<String, String>,
    ) -> ControlPlaneFuture<'a, ()> {
        Box::pin(async move { self.tag(instance_id, tags) })
    }

    fn list_addresses<'a>(
        &'a self,
        public_ip: &'a str,
    ) -> ControlPlaneFuture<'a, Vec<ElasticAddress>> {
        Box::pin(async move { self.addresses(public_ip) })
    }

    fn associate_address<'a>(
        &'a self,
        instance_id: &'a str,
        address: &'a ElasticAddress,
    ) -> ControlPlaneFuture<'a, ()> {
        Box::pin(async move { self.associate(instance_id, address) })
    }

    fn list_network_interface_ids<'a>(
        &'a self,
        vpc_id: Option<&'a str>,
    ) -> ControlPlaneFuture<'a, Vec<String>> {
        Box::pin(async move { self.interface_ids(vpc_id) })
    }

    fn attach_network_interface<'a>(
        &'a self,
        interface_id: &'a str,
        instance_id: &'a str,
        device_index: u32,
    ) -> ControlPlaneFuture<'a, String> {
        Box::pin(async move { self.attach(interface_id, instance_id, device_index) })
    }

    fn network_interface_attachment_status<'a>(
        &'a self,
        interface_id: &'a str,
    ) -> ControlPlaneFuture<'a, Option<AttachmentStatus>> {
        Box::pin(async move { self.attachment_status(interface_id) })
    }

    fn password_data<'a>(&'a self, instance_id: &'a str) -> ControlPlaneFuture<'a, Option<String>> {
        Box::pin(async move { self.password(instance_id) })
    }
}
