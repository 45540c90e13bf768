use crate::node::NodeRecord;
use crate::utils::error::{Result, SpeedtestError};
use serde_json::{json, Value};
use tracing::warn;

/// Pull the first element of `outbounds` out of a node's own client config.
pub fn extract_outbound(node: &NodeRecord) -> Result<Value> {
    let doc: Value = serde_json::from_str(&node.rendered_config)
        .map_err(|_| SpeedtestError::MissingOutbound(node.id))?;
    match doc.get("outbounds").and_then(Value::as_array).and_then(|a| a.first()) {
        Some(outbound) if outbound.is_object() => Ok(outbound.clone()),
        _ => Err(SpeedtestError::MissingOutbound(node.id)),
    }
}

/// Split off nodes whose rendered config has no usable outbound.
pub fn partition_extractable(nodes: Vec<NodeRecord>) -> (Vec<NodeRecord>, Vec<NodeRecord>) {
    nodes.into_iter().partition(|node| match extract_outbound(node) {
        Ok(_) => true,
        Err(e) => {
            warn!(node_id = node.id, remarks = %node.remarks, error = %e, "Dropping node from shard");
            false
        }
    })
}

/// One client config fronting many nodes: a SOCKS inbound per node routed
/// to that node's outbound.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedConfig {
    document: Value,
}

impl AggregatedConfig {
    pub fn build(members: &[NodeRecord], ports: &[u16]) -> Result<Self> {
        if members.len() != ports.len() {
            return Err(SpeedtestError::Protocol(format!(
                "{} members but {} ports",
                members.len(),
                ports.len()
            )));
        }

        let mut inbounds = Vec::with_capacity(members.len());
        let mut outbounds = Vec::with_capacity(members.len());
        let mut rules = Vec::with_capacity(members.len());

        for (node, &port) in members.iter().zip(ports) {
            let in_tag = format!("in_{}", node.id);
            let out_tag = format!("out_{}", node.id);

            inbounds.push(json!({
                "tag": in_tag,
                "listen": "127.0.0.1",
                "port": port,
                "protocol": "socks",
                "settings": { "udp": true, "auth": "noauth" },
            }));

            let mut outbound = extract_outbound(node)?;
            if let Some(obj) = outbound.as_object_mut() {
                obj.insert("tag".to_string(), Value::String(out_tag.clone()));
            }
            outbounds.push(outbound);

            rules.push(json!({
                "type": "field",
                "inboundTag": [in_tag],
                "outboundTag": out_tag,
            }));
        }

        Ok(Self {
            document: json!({
                "log": { "loglevel": "warning" },
                "inbounds": inbounds,
                "outbounds": outbounds,
                "routing": { "domainStrategy": "AsIs", "rules": rules },
            }),
        })
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn to_json(&self) -> String {
        self.document.to_string()
    }
}
