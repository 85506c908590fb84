/*!
Builders for topology entries and inbound notifications in the shapes the
monitors publish them.
*/

use serde_json::{json, Value};
use uuid::Uuid;
use vigil_kernel::models::{FailoverSegment, Host, NotificationIn, RecoveryMethod};

pub fn segment(name: &str, recovery_method: RecoveryMethod) -> FailoverSegment {
    FailoverSegment {
        uuid: Uuid::new_v4(),
        name: name.to_string(),
        service_type: "compute".to_string(),
        recovery_method,
        description: None,
    }
}

pub fn host(name: &str, segment: &FailoverSegment) -> Host {
    Host {
        uuid: Uuid::new_v4(),
        name: name.to_string(),
        failover_segment_id: segment.uuid,
        host_type: "COMPUTE".to_string(),
        control_attributes: "SSH".to_string(),
        reserved: false,
        on_maintenance: false,
    }
}

/// Wire payload of a host monitor reporting `hostname` down
pub fn host_failure_json(hostname: &str) -> Value {
    json!({
        "hostname": hostname,
        "type": "COMPUTE_HOST",
        "payload": {
            "event": "STOPPED",
            "host_status": "NORMAL",
            "cluster_status": "OFFLINE"
        }
    })
}

pub fn host_failure(hostname: &str) -> NotificationIn {
    parse(host_failure_json(hostname))
}

/// An instance monitor reporting `instance_uuid` stopped on `hostname`
pub fn vm_failure(hostname: &str, instance_uuid: &str) -> NotificationIn {
    parse(json!({
        "hostname": hostname,
        "type": "VM",
        "payload": {
            "event": "LIFECYCLE",
            "instance_uuid": instance_uuid,
            "vir_domain_event": "STOPPED_FAILED"
        }
    }))
}

pub fn process_failure(hostname: &str, process_name: &str) -> NotificationIn {
    parse(json!({
        "hostname": hostname,
        "type": "PROCESS",
        "payload": {
            "event": "STOPPED",
            "process_name": process_name
        }
    }))
}

fn parse(value: Value) -> NotificationIn {
    // the fixtures above are static shapes; a failure here is a bug in this file
    match serde_json::from_value(value) {
        Ok(n) => n,
        Err(e) => panic!("invalid notification fixture: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_kernel::models::NotificationType;

    #[test]
    fn test_fixtures_parse_as_notifications() {
        assert_eq!(host_failure("compute-1").notification_type, NotificationType::ComputeHost);

        let vm = vm_failure("compute-1", "inst-1").into_notification();
        assert_eq!(vm.notification_type, NotificationType::Vm);
        assert_eq!(vm.instance_uuid(), Some("inst-1"));

        assert_eq!(process_failure("compute-1", "nova-compute").notification_type, NotificationType::Process);
    }
}
