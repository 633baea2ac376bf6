use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::Result;
use crate::job::{CloudTarget, JobDocument, StageJob};

/// Turns a submitted job document into the document one stage receives.
pub trait MessageBuilder: Send + Sync {
    fn build(&self, service: &str, doc: &JobDocument) -> Result<StageJob>;
}

/// Default builder: every stage receives the common fields plus the whole
/// provider payload. A payload entry named after the stage holding an object
/// is lifted to the top level for that stage only.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughBuilder;

impl MessageBuilder for PassthroughBuilder {
    fn build(&self, service: &str, doc: &JobDocument) -> Result<StageJob> {
        let mut fields = Map::new();
        if let Some(cloud) = doc.cloud {
            fields.insert("cloud".into(), Value::String(cloud.to_string()));
        }
        if let Some(image) = &doc.image {
            fields.insert("image".into(), Value::String(image.clone()));
        }
        for (key, value) in &doc.payload {
            if key == service
                && let Value::Object(section) = value
            {
                fields.extend(section.clone());
                continue;
            }
            fields.insert(key.clone(), value.clone());
        }

        Ok(StageJob {
            id: doc.id.clone(),
            utctime: doc.utctime,
            last_service: doc.last_service.clone(),
            notification_email: doc.notification_email.clone(),
            notification_type: doc.notification_type,
            cloud_accounts: doc.cloud_accounts.clone(),
            fields,
        })
    }
}

/// Message builders keyed by cloud target, with a fallback for documents
/// that name no target or one without a registered builder.
#[derive(Clone)]
pub struct MessageBuilders {
    fallback: Arc<dyn MessageBuilder>,
    by_cloud: HashMap<CloudTarget, Arc<dyn MessageBuilder>>,
}

impl fmt::Debug for MessageBuilders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBuilders")
            .field("clouds", &self.by_cloud.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for MessageBuilders {
    fn default() -> Self {
        Self::new(Arc::new(PassthroughBuilder))
    }
}

impl MessageBuilders {
    pub fn new(fallback: Arc<dyn MessageBuilder>) -> Self {
        Self {
            fallback,
            by_cloud: HashMap::new(),
        }
    }

    pub fn register(mut self, cloud: CloudTarget, builder: Arc<dyn MessageBuilder>) -> Self {
        self.by_cloud.insert(cloud, builder);
        self
    }

    pub fn for_cloud(&self, cloud: Option<CloudTarget>) -> &dyn MessageBuilder {
        cloud
            .and_then(|cloud| self.by_cloud.get(&cloud))
            .unwrap_or(&self.fallback)
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> JobDocument {
        serde_json::from_value(json!({
            "id": "42",
            "cloud": "ec2",
            "utctime": "now",
            "last_service": "publish",
            "image": "sles-16-byos",
            "cloud_accounts": ["acct1"],
            "target_regions": ["us-east-1"],
            "test": {"distro": "sles", "instance_type": "t3.large"}
        }))
        .unwrap()
    }

    #[test]
    fn passthrough_lifts_the_stage_section() {
        let doc = document();
        let test = PassthroughBuilder.build("test", &doc).unwrap();
        assert_eq!(test.fields["instance_type"], json!("t3.large"));
        assert_eq!(test.fields["target_regions"], json!(["us-east-1"]));
        assert_eq!(test.fields["image"], json!("sles-16-byos"));
        assert!(!test.fields.contains_key("test"));

        let upload = PassthroughBuilder.build("upload", &doc).unwrap();
        assert_eq!(upload.fields["test"]["distro"], json!("sles"));
        assert_eq!(upload.cloud_accounts, vec!["acct1".to_string()]);
    }

    #[test]
    fn registry_falls_back_for_unregistered_clouds() {
        struct Tagged;
        impl MessageBuilder for Tagged {
            fn build(&self, service: &str, doc: &JobDocument) -> Result<StageJob> {
                let mut job = PassthroughBuilder.build(service, doc)?;
                job.fields.insert("tagged".into(), json!(true));
                Ok(job)
            }
        }

        let builders = MessageBuilders::default().register(CloudTarget::Azure, Arc::new(Tagged));
        let doc = document();
        let built = builders.for_cloud(doc.cloud).build("test", &doc).unwrap();
        assert!(!built.fields.contains_key("tagged"));
        let built = builders
            .for_cloud(Some(CloudTarget::Azure))
            .build("test", &doc)
            .unwrap();
        assert_eq!(built.fields["tagged"], json!(true));
    }
}
