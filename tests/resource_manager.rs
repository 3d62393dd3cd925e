//! Integration tests for the resource manager against the stub provider
//!
//! Each test wires a programmable `StubSession` into an execution context
//! built on the embedded catalogs, then checks both the records returned
//! and the provider calls made on the way.

use async_trait::async_trait;
use custodia::error::LimitKind;
use custodia::policy::{ExecutionContext, Policy, PolicyData, RunOptions};
use custodia::provider::stub::StubSession;
use custodia::provider::{Params, ProviderError};
use custodia::resource::{ChildResourceQuery, ManagerCore, QueryResourceManager, Registry, PARENT_ANNOTATION};
use custodia::retry::Sleeper;
use custodia::Error;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ACCOUNT: &str = "123456789012";
const REGION: &str = "us-east-1";

/// Counts backoff waits without sleeping
#[derive(Default)]
struct CountingSleeper {
    sleeps: AtomicUsize,
}

#[async_trait]
impl Sleeper for CountingSleeper {
    async fn sleep(&self, _delay: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
    }
}

fn policy_data(resource: &str) -> PolicyData {
    PolicyData {
        name: format!("{}-test", resource),
        resource: resource.to_string(),
        ..Default::default()
    }
}

fn context(data: PolicyData, session: &StubSession, dry_run: bool) -> (ExecutionContext, Arc<CountingSleeper>) {
    let registry = Registry::builtin().unwrap();
    let session = session.clone().with_services(registry.services());
    let options = RunOptions {
        account_id: ACCOUNT.to_string(),
        region: REGION.to_string(),
        dry_run,
    };
    let sleeper = Arc::new(CountingSleeper::default());
    let ctx = ExecutionContext::new(data, &options, Arc::new(session), Arc::new(registry)).with_sleeper(sleeper.clone());
    (ctx, sleeper)
}

fn manager(data: PolicyData, session: &StubSession) -> QueryResourceManager {
    let (ctx, _) = context(data, session, false);
    let ctx = Arc::new(ctx);
    let kind = ctx.registry.get(&ctx.policy.resource).unwrap();
    let source = ctx.policy.source.clone();
    QueryResourceManager::new(Arc::new(ManagerCore::new(ctx, kind)), source.as_deref()).unwrap()
}

fn ids(resources: &[Value], field: &str) -> Vec<String> {
    let mut ids: Vec<String> = resources
        .iter()
        .filter_map(|r| r.get(field).and_then(|v| v.as_str()))
        .map(|s| s.to_string())
        .collect();
    ids.sort();
    ids
}

fn images(n: usize) -> Value {
    let images: Vec<Value> = (0..n).map(|i| json!({"ImageId": format!("ami-{}", i)})).collect();
    json!({ "Images": images })
}

mod child_query {
    use super::*;

    #[tokio::test]
    async fn test_no_parents_means_no_child_calls() {
        let session = StubSession::new()
            .respond("efs", "describe_file_systems", json!({"FileSystems": []}))
            .respond("efs", "describe_mount_targets", json!({"MountTargets": [{"MountTargetId": "fsmt-x"}]}));

        let resources = manager(policy_data("efs-mount-target"), &session)
            .resources(None)
            .await
            .unwrap();

        assert!(resources.is_empty());
        assert_eq!(session.calls_to("efs", "describe_file_systems").len(), 1);
        assert!(session.calls_to("efs", "describe_mount_targets").is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_annotates_and_skips_vanished_parent() {
        let session = StubSession::new()
            .respond(
                "efs",
                "describe_file_systems",
                json!({"FileSystems": [{"FileSystemId": "fs-1"}, {"FileSystemId": "fs-2"}]}),
            )
            .on("efs", "describe_mount_targets", |params: &Params| {
                match params.get("FileSystemId").and_then(|v| v.as_str()) {
                    Some("fs-2") => Err(ProviderError::new("FileSystemNotFound", "gone")),
                    Some(fs) => Ok(json!({"MountTargets": [{"MountTargetId": format!("fsmt-{}", fs)}]})),
                    None => Ok(json!({"MountTargets": []})),
                }
            });

        let mgr = manager(policy_data("efs-mount-target"), &session);
        assert_eq!(mgr.source_type(), "describe-child");
        let resources = mgr.resources(None).await.unwrap();

        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0]["MountTargetId"], "fsmt-fs-1");
        assert_eq!(resources[0][PARENT_ANNOTATION], "fs-1");
        assert_eq!(session.calls_to("efs", "describe_mount_targets").len(), 2);
    }

    #[tokio::test]
    async fn test_explicit_parent_query_skips_parent_enumeration() {
        let session = StubSession::new().respond(
            "efs",
            "describe_mount_targets",
            json!({"MountTargets": [{"MountTargetId": "fsmt-1"}]}),
        );

        let mut query = Params::new();
        query.insert("FileSystemId".into(), json!("fs-9"));
        let resources = manager(policy_data("efs-mount-target"), &session)
            .resources(Some(&query))
            .await
            .unwrap();

        assert_eq!(resources[0][PARENT_ANNOTATION], "fs-9");
        assert!(session.calls_to("efs", "describe_file_systems").is_empty());
    }

    fn three_file_systems() -> StubSession {
        StubSession::new()
            .respond(
                "efs",
                "describe_file_systems",
                json!({"FileSystems": [
                    {"FileSystemId": "fs-1"}, {"FileSystemId": "fs-2"}, {"FileSystemId": "fs-3"}
                ]}),
            )
            .on("efs", "describe_mount_targets", |params: &Params| {
                let targets: Vec<Value> = match params.get("FileSystemId").and_then(|v| v.as_str()) {
                    Some("fs-1") => vec![json!({"MountTargetId": "fsmt-a"}), json!({"MountTargetId": "fsmt-b"})],
                    Some("fs-2") => vec![json!({"MountTargetId": "fsmt-c"})],
                    _ => Vec::new(),
                };
                let wanted = params.get("MountTargetId").and_then(|v| v.as_str());
                let targets: Vec<Value> = targets
                    .into_iter()
                    .filter(|t| wanted.map_or(true, |w| t["MountTargetId"] == w))
                    .collect();
                Ok(json!({ "MountTargets": targets }))
            })
    }

    #[tokio::test]
    async fn test_pairs_follow_parent_order() {
        let session = three_file_systems();
        let (ctx, _) = context(policy_data("efs-mount-target"), &session, false);
        let ctx = Arc::new(ctx);
        let kind = ctx.registry.get("efs-mount-target").unwrap();
        let core = Arc::new(ManagerCore::new(ctx, kind).with_max_workers(3));

        let pairs = ChildResourceQuery::new(core).filter_pairs(Params::new()).await.unwrap();

        let flat: Vec<(&str, &str)> = pairs
            .iter()
            .map(|(parent, record)| (parent.as_str(), record["MountTargetId"].as_str().unwrap()))
            .collect();
        assert_eq!(flat, vec![("fs-1", "fsmt-a"), ("fs-1", "fsmt-b"), ("fs-2", "fsmt-c")]);
        // Pairs carry the parent; bare records are not annotated
        assert!(pairs.iter().all(|(_, record)| record.get(PARENT_ANNOTATION).is_none()));
        assert_eq!(session.calls_to("efs", "describe_mount_targets").len(), 3);
    }

    #[tokio::test]
    async fn test_get_resources_matches_children_across_parents() {
        let session = three_file_systems();
        let mgr = manager(policy_data("efs-mount-target"), &session);

        let wanted = vec!["fsmt-c".to_string(), "fsmt-a".to_string(), "fsmt-z".to_string()];
        let resources = mgr.get_resources(&wanted, false, false).await.unwrap();

        assert_eq!(ids(&resources, "MountTargetId"), vec!["fsmt-a", "fsmt-c"]);
        let parents: Vec<&str> = resources.iter().filter_map(|r| r[PARENT_ANNOTATION].as_str()).collect();
        assert_eq!(parents.len(), 2);
        assert!(parents.contains(&"fs-1") && parents.contains(&"fs-2"));
        assert_eq!(session.calls_to("efs", "describe_mount_targets").len(), 3);
    }

    fn filtered_child_manager(session: &StubSession) -> QueryResourceManager {
        let mut registry = Registry::builtin().unwrap();
        registry
            .load_catalog_str(
                r#"{"resources": {"efs-mount-target-by-id": {
                    "service": "efs",
                    "enum_spec": {"operation": "describe_mount_targets", "path": "MountTargets"},
                    "id": "MountTargetId",
                    "filter_name": "MountTargetId",
                    "filter_type": "scalar",
                    "parent_spec": {"kind": "efs", "key": "FileSystemId"},
                    "taggable": false
                }}}"#,
            )
            .unwrap();
        let session = session.clone().with_services(registry.services());
        let options = RunOptions {
            account_id: ACCOUNT.to_string(),
            region: REGION.to_string(),
            dry_run: false,
        };
        let ctx = Arc::new(ExecutionContext::new(
            policy_data("efs-mount-target-by-id"),
            &options,
            Arc::new(session),
            Arc::new(registry),
        ));
        let kind = ctx.registry.get("efs-mount-target-by-id").unwrap();
        QueryResourceManager::new(Arc::new(ManagerCore::new(ctx, kind)), None).unwrap()
    }

    #[tokio::test]
    async fn test_get_applies_server_filter_to_each_parent() {
        let session = three_file_systems();
        let mgr = filtered_child_manager(&session);

        let resources = mgr.get_resources(&["fsmt-b".to_string()], false, false).await.unwrap();

        assert_eq!(ids(&resources, "MountTargetId"), vec!["fsmt-b"]);
        let calls = session.calls_to("efs", "describe_mount_targets");
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c["MountTargetId"] == "fsmt-b"));
    }

    #[tokio::test]
    async fn test_get_scalar_server_filter_rejects_many_ids() {
        let session = three_file_systems();
        let mgr = filtered_child_manager(&session);

        let result = ChildResourceQuery::new(mgr.core().clone())
            .get(&["fsmt-a".to_string(), "fsmt-b".to_string()])
            .await;

        assert!(matches!(result, Err(Error::Contract(_))));
        assert!(session.calls_to("efs", "describe_mount_targets").is_empty());
    }
}

mod augmentation {
    use super::*;

    fn cert_arn(n: u32) -> String {
        format!("arn:aws:acm:{}:{}:certificate/{}", REGION, ACCOUNT, n)
    }

    #[tokio::test]
    async fn test_scalar_not_found_drops_only_that_record() {
        let listed: Vec<Value> = (1..=3).map(|n| json!({"CertificateArn": cert_arn(n)})).collect();
        let missing = cert_arn(2);
        let session = StubSession::new()
            .respond("acm", "list_certificates", json!({"CertificateSummaryList": listed}))
            .on("acm", "describe_certificate", move |params: &Params| {
                let arn = params["CertificateArn"].as_str().unwrap_or_default().to_string();
                if arn == missing {
                    return Err(ProviderError::new("ResourceNotFoundException", "deleted"));
                }
                Ok(json!({"Certificate": {"CertificateArn": arn, "Status": "ISSUED"}}))
            })
            .respond(
                "resourcegroupstaggingapi",
                "get_resources",
                json!({"ResourceTagMappingList": [
                    {"ResourceARN": cert_arn(1), "Tags": [{"Key": "Env", "Value": "prod"}]}
                ]}),
            );

        let resources = manager(policy_data("acm-certificate"), &session)
            .resources(None)
            .await
            .unwrap();

        assert_eq!(ids(&resources, "CertificateArn"), vec![cert_arn(1), cert_arn(3)]);
        assert!(resources.iter().all(|r| r["Status"] == "ISSUED"));
        assert_eq!(session.calls_to("acm", "describe_certificate").len(), 3);

        let tagged = resources.iter().find(|r| r["CertificateArn"] == cert_arn(1).as_str()).unwrap();
        assert_eq!(tagged["Tags"], json!([{"Key": "Env", "Value": "prod"}]));
        let untagged = resources.iter().find(|r| r["CertificateArn"] == cert_arn(3).as_str()).unwrap();
        assert!(untagged.get("Tags").is_none());

        let tag_calls = session.calls_to("resourcegroupstaggingapi", "get_resources");
        assert_eq!(tag_calls.len(), 1);
        assert_eq!(tag_calls[0]["ResourceTypeFilters"], json!(["acm:certificate"]));
    }

    #[tokio::test]
    async fn test_scalar_detail_replaces_raw_identity() {
        let session = StubSession::new()
            .respond("eks", "list_clusters", json!({"clusters": ["alpha", "beta"]}))
            .on("eks", "describe_cluster", |params: &Params| {
                let name = params["name"].as_str().unwrap_or_default();
                Ok(json!({"cluster": {
                    "status": "ACTIVE",
                    "arn": format!("arn:aws:eks:us-east-1:123456789012:cluster/{}", name)
                }}))
            })
            .respond("resourcegroupstaggingapi", "get_resources", json!({"ResourceTagMappingList": []}));

        let resources = manager(policy_data("eks"), &session).resources(None).await.unwrap();

        assert_eq!(ids(&resources, "name"), vec!["alpha", "beta"]);
        assert!(resources.iter().all(|r| r["status"] == "ACTIVE"));
    }

    #[tokio::test]
    async fn test_batch_detail_chunks_by_batch_size() {
        let fleet_ids: Vec<String> = (0..20).map(|i| format!("fleet-{:02}", i)).collect();
        let session = StubSession::new()
            .respond("gamelift", "list_fleets", json!({ "FleetIds": fleet_ids }))
            .on("gamelift", "describe_fleet_attributes", |params: &Params| {
                let attributes: Vec<Value> = params["FleetIds"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|id| {
                        let id = id.as_str().unwrap_or_default().to_string();
                        json!({
                            "FleetId": id,
                            "FleetArn": format!("arn:aws:gamelift:us-east-1:123456789012:fleet/{}", id)
                        })
                    })
                    .collect();
                Ok(json!({ "FleetAttributes": attributes }))
            })
            .respond(
                "resourcegroupstaggingapi",
                "get_resources",
                json!({"ResourceTagMappingList": [{
                    "ResourceARN": "arn:aws:gamelift:us-east-1:123456789012:fleet/fleet-03",
                    "Tags": [{"Key": "Team", "Value": "games"}]
                }]}),
            );

        let resources = manager(policy_data("gamelift-fleet"), &session)
            .resources(None)
            .await
            .unwrap();

        assert_eq!(resources.len(), 20);
        let mut sizes: Vec<usize> = session
            .calls_to("gamelift", "describe_fleet_attributes")
            .iter()
            .map(|p| p["FleetIds"].as_array().map(|a| a.len()).unwrap_or(0))
            .collect();
        sizes.sort();
        assert_eq!(sizes, vec![4, 16]);

        let tagged: Vec<&Value> = resources.iter().filter(|r| r.get("Tags").is_some()).collect();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0]["FleetId"], "fleet-03");
    }
}

mod config_source {
    use super::*;

    #[tokio::test]
    async fn test_empty_history_dropped_and_failed_chunk_isolated() {
        let identifiers: Vec<Value> = (0..60).map(|i| json!({"resourceId": format!("i-{}", i)})).collect();
        let session = StubSession::new()
            .respond("config", "list_discovered_resources", json!({ "resourceIdentifiers": identifiers }))
            .on("config", "get_resource_config_history", |params: &Params| {
                let id = params["resourceId"].as_str().unwrap_or_default().to_string();
                match id.as_str() {
                    "i-3" => Ok(json!({"configurationItems": []})),
                    "i-55" => Err(ProviderError::new("AccessDeniedException", "denied")),
                    _ => Ok(json!({"configurationItems": [{
                        "configuration": format!("{{\"instanceId\": \"{}\", \"state\": {{\"name\": \"running\"}}}}", id),
                        "tags": {"Env": "prod"}
                    }]})),
                }
            });

        let data = PolicyData {
            source: Some("config".into()),
            ..policy_data("ec2")
        };
        let mgr = manager(data, &session);
        assert_eq!(mgr.source_type(), "config");
        let resources = mgr.resources(None).await.unwrap();

        // first chunk of 50 minus the empty history; the second chunk failed
        assert_eq!(resources.len(), 49);
        assert!(!ids(&resources, "InstanceId").contains(&"i-3".to_string()));
        assert!(resources.iter().all(|r| r["State"]["Name"] == "running"));
        assert!(resources.iter().all(|r| r["Tags"] == json!([{"Key": "Env", "Value": "prod"}])));

        let history_calls = session.calls_to("config", "get_resource_config_history");
        assert!(history_calls.iter().all(|p| p["limit"] == 1 && p["resourceType"] == "AWS::EC2::Instance"));
        assert!(session.calls_to("ec2", "describe_instances").is_empty());
    }

    #[tokio::test]
    async fn test_config_source_requires_config_type() {
        let session = StubSession::new();
        let data = PolicyData {
            source: Some("config".into()),
            ..policy_data("glue-connection")
        };
        let err = manager(data, &session).resources(None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

mod manager_behaviour {
    use super::*;

    #[tokio::test]
    async fn test_population_is_cached_per_run() {
        let session = StubSession::new().respond("ec2", "describe_images", images(3));
        let mgr = manager(policy_data("ami"), &session);

        assert_eq!(mgr.resources(None).await.unwrap().len(), 3);
        assert_eq!(mgr.resources(None).await.unwrap().len(), 3);
        assert_eq!(session.calls_to("ec2", "describe_images").len(), 1);

        // cached lookups filter the cached population by identity
        let found = mgr
            .get_resources(&["ami-1".to_string(), "ami-9".to_string()], true, true)
            .await
            .unwrap();
        assert_eq!(ids(&found, "ImageId"), vec!["ami-1"]);
        assert_eq!(session.calls_to("ec2", "describe_images").len(), 1);
    }

    #[tokio::test]
    async fn test_extra_args_fill_missing_params() {
        let session = StubSession::new().respond("ec2", "describe_images", images(1));
        manager(policy_data("ami"), &session).resources(None).await.unwrap();

        let mut query = Params::new();
        query.insert("Owners".into(), json!(["amazon"]));
        manager(policy_data("ami"), &session).resources(Some(&query)).await.unwrap();

        let calls = session.calls_to("ec2", "describe_images");
        assert_eq!(calls[0]["Owners"], json!(["self"]));
        assert_eq!(calls[1]["Owners"], json!(["amazon"]));
    }

    #[tokio::test]
    async fn test_get_resources_list_filter_and_degradation() {
        let session = StubSession::new().respond("ec2", "describe_images", images(2));
        let mgr = manager(policy_data("ami"), &session);
        let wanted = vec!["ami-0".to_string(), "ami-1".to_string()];
        mgr.get_resources(&wanted, false, false).await.unwrap();
        assert_eq!(session.calls_to("ec2", "describe_images")[0]["ImageIds"], json!(wanted));

        let failing = StubSession::new().on("ec2", "describe_images", |_: &Params| {
            Err(ProviderError::new("UnauthorizedOperation", "denied"))
        });
        let resolved = manager(policy_data("ami"), &failing)
            .get_resources(&wanted, false, true)
            .await
            .unwrap();
        assert!(resolved.is_empty());

        assert!(mgr.get_resources(&[], false, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scalar_filter_rejects_multiple_ids() {
        let session = StubSession::new();
        let err = manager(policy_data("efs"), &session)
            .get_resources(&["fs-1".to_string(), "fs-2".to_string()], false, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Contract(_)));
        assert!(session.calls().is_empty());
    }

    #[tokio::test]
    async fn test_throttled_enumeration_is_retried() {
        let session = StubSession::new().sequence(
            "ec2",
            "describe_images",
            vec![
                Err(ProviderError::new("RequestLimitExceeded", "slow down")),
                Err(ProviderError::new("Throttling", "slow down")),
                Ok(images(2)),
            ],
        );
        let (ctx, sleeper) = context(policy_data("ami"), &session, false);
        let run = Policy::new(ctx).run().await.unwrap();

        assert_eq!(run.selection.len(), 2);
        assert_eq!(sleeper.sleeps.load(Ordering::SeqCst), 2);
        assert_eq!(session.calls_to("ec2", "describe_images").len(), 3);
    }

    #[test]
    fn test_arns_and_permissions() {
        let session = StubSession::new();
        let mgr = manager(policy_data("ec2"), &session);
        let arns = mgr.core().get_arns(&[json!({"InstanceId": "i-1"}), json!({"State": "orphan"})]);
        assert_eq!(arns, vec!["arn:aws:ec2:us-east-1:123456789012:instance/i-1"]);
        assert_eq!(
            mgr.core().match_ids(&["i-1".to_string(), "vol-1".to_string()]),
            vec!["i-1".to_string()]
        );

        let perms = manager(policy_data("acm-certificate"), &session).permissions();
        assert_eq!(
            perms,
            vec!["acm:ListCertificates", "acm:DescribeCertificate", "tag:GetResources"]
        );
    }
}

mod policy_run {
    use super::*;

    fn instances() -> Value {
        json!({"Reservations": [
            {"Instances": [{"InstanceId": "i-1", "State": {"Name": "running"}}]},
            {"Instances": [{"InstanceId": "i-2", "State": {"Name": "stopped"}}]}
        ]})
    }

    fn tagging_policy() -> PolicyData {
        PolicyData {
            filters: vec![json!({"State.Name": "running"})],
            actions: vec![json!({"type": "tag", "key": "Owner", "value": "ops"})],
            ..policy_data("ec2")
        }
    }

    #[tokio::test]
    async fn test_limit_breaker_aborts_before_actions() {
        let session = StubSession::new()
            .respond("ec2", "describe_images", images(5))
            .respond("ec2", "create_tags", json!({}));
        let data = PolicyData {
            max_resources: Some(2),
            actions: vec![json!({"type": "mark", "msg": "review"})],
            ..policy_data("ami")
        };
        let (ctx, _) = context(data, &session, false);

        let limit = match Policy::new(ctx).run().await {
            Err(Error::ResourceLimit(limit)) => limit,
            other => panic!("expected a resource limit error, got {:?}", other.map(|r| r.selection.len())),
        };
        assert_eq!(limit.limit, LimitKind::MaxResources(2));
        assert_eq!(limit.selection_count, 5);
        assert_eq!(limit.population_count, 5);
        assert!(session.calls_to("ec2", "create_tags").is_empty());
    }

    #[tokio::test]
    async fn test_percent_limit_applies_to_filtered_selection() {
        let session = StubSession::new().respond("ec2", "describe_instances", instances());
        let data = PolicyData {
            max_resources_percent: Some(50.0),
            ..tagging_policy()
        };
        let (ctx, _) = context(data, &session, true);
        let run = Policy::new(ctx).run().await.unwrap();
        assert_eq!(run.population, 2);
        assert_eq!(run.selection.len(), 1);
    }

    #[tokio::test]
    async fn test_tag_action_on_selection() {
        let session = StubSession::new()
            .respond("ec2", "describe_instances", instances())
            .respond("ec2", "create_tags", json!({}));
        let (ctx, _) = context(tagging_policy(), &session, false);

        let run = Policy::new(ctx).run().await.unwrap();
        assert_eq!(run.selection.len(), 1);
        assert!(!run.dry_run);

        let calls = session.calls_to("ec2", "create_tags");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["Resources"], json!(["i-1"]));
        assert_eq!(calls[0]["Tags"], json!([{"Key": "Owner", "Value": "ops"}]));
    }

    #[tokio::test]
    async fn test_dry_run_skips_actions() {
        let session = StubSession::new()
            .respond("ec2", "describe_instances", instances())
            .respond("ec2", "create_tags", json!({}));
        let (ctx, _) = context(tagging_policy(), &session, true);

        let run = Policy::new(ctx).run().await.unwrap();
        assert!(run.dry_run);
        assert_eq!(run.selection.len(), 1);
        assert!(session.calls_to("ec2", "create_tags").is_empty());
    }

    #[tokio::test]
    async fn test_universal_tag_retries_throttled_items() {
        let fs = |n: u32| {
            json!({
                "FileSystemId": format!("fs-{}", n),
                "FileSystemArn": format!("arn:aws:elasticfilesystem:us-east-1:123456789012:file-system/fs-{}", n)
            })
        };
        let throttled_arn = "arn:aws:elasticfilesystem:us-east-1:123456789012:file-system/fs-2";
        let session = StubSession::new()
            .respond("efs", "describe_file_systems", json!({"FileSystems": [fs(1), fs(2)]}))
            .respond("resourcegroupstaggingapi", "get_resources", json!({"ResourceTagMappingList": []}))
            .sequence(
                "resourcegroupstaggingapi",
                "tag_resources",
                vec![
                    Ok(json!({"FailedResourcesMap": {throttled_arn: {"ErrorCode": "ThrottlingException"}}})),
                    Ok(json!({"FailedResourcesMap": {}})),
                ],
            );
        let data = PolicyData {
            actions: vec![json!({"type": "tag", "tags": {"Owner": "ops"}})],
            ..policy_data("efs")
        };
        let (ctx, sleeper) = context(data, &session, false);

        Policy::new(ctx).run().await.unwrap();

        let calls = session.calls_to("resourcegroupstaggingapi", "tag_resources");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["ResourceARNList"].as_array().map(|a| a.len()), Some(2));
        assert_eq!(calls[1]["ResourceARNList"], json!([throttled_arn]));
        assert_eq!(calls[1]["Tags"], json!({"Owner": "ops"}));
        assert_eq!(sleeper.sleeps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_universal_tag_surfaces_item_errors() {
        let session = StubSession::new()
            .respond(
                "efs",
                "describe_file_systems",
                json!({"FileSystems": [{"FileSystemId": "fs-1", "FileSystemArn": "arn:fs-1"}]}),
            )
            .respond("resourcegroupstaggingapi", "get_resources", json!({"ResourceTagMappingList": []}))
            .respond(
                "resourcegroupstaggingapi",
                "untag_resources",
                json!({"FailedResourcesMap": {"arn:fs-1": {"ErrorCode": "InvalidParameterException"}}}),
            );
        let data = PolicyData {
            actions: vec![json!({"type": "unmark"})],
            ..policy_data("efs")
        };
        let (ctx, _) = context(data, &session, false);

        let err = Policy::new(ctx).run().await.unwrap_err();
        assert!(matches!(err, Error::TagErrors { ref errors } if errors["arn:fs-1"] == "InvalidParameterException"));
        let calls = session.calls_to("resourcegroupstaggingapi", "untag_resources");
        assert_eq!(calls[0]["TagKeys"], json!(["maid_status"]));
    }
}
