//! End-to-end fetch cycles against a mocked storage service

mod common;

use aipscan_aggregator::error::{AggregatorError, ErrorKind};
use aipscan_aggregator::ingest::mets::parse_mets;
use aipscan_aggregator::ingest::package::PackageRecord;
use aipscan_aggregator::ingest::PageSelection;
use anyhow::Result;
use common::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn test_single_aip_is_ingested() -> Result<()> {
    let env = TestEnv::start().await?;
    env.mount_single_aip(&mets_xml("myTransfer", "")).await;

    let report = env.coordinator().run(env.service.id).await?;

    let aips = env.store.aips_by_uuid(AIP_UUID).await?;
    assert_eq!(aips.len(), 1);
    let aip = &aips[0];
    assert_eq!(aip.transfer_name, "myTransfer");
    assert_eq!(aip.uuid, AIP_UUID);
    assert_eq!(aip.size, Some(12345));
    assert_eq!(aip.fetch_job_id, report.fetch_job.id);
    assert_eq!(aip.originals_count, Some(1));
    assert_eq!(aip.copies_count, Some(1));
    assert_eq!(
        aip.create_date.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "2020-02-11T10:04:16"
    );

    let job = &report.fetch_job;
    assert!(job.is_complete());
    assert_eq!(job.total_packages, Some(1));
    assert_eq!(job.total_aips, Some(1));
    assert_eq!(job.total_replicas, Some(0));
    assert_eq!(job.total_deleted_aips, Some(0));
    assert_eq!(report.workers.ingested, 1);
    assert_eq!(report.summary(), "aips: '1'; sips: '0'; dips: '0'; deleted: '0'; replicated: '0'");

    let locations = env.store.storage_locations(env.service.id).await?;
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].description.as_deref(), Some("AIP Store"));
    assert_eq!(aip.storage_location_id, Some(locations[0].id));
    assert!(aip.origin_pipeline_id.is_some());

    // The METS is removed once written; the staged page stays.
    let staging = std::path::Path::new(&job.download_directory);
    assert!(staging.join("packages").join("packages1.json").is_file());
    assert!(!staging.join("mets").join("1").join(format!("{}.xml", AIP_UUID)).exists());

    Ok(())
}

#[tokio::test]
async fn test_rerun_with_identical_mets_is_idempotent() -> Result<()> {
    let env = TestEnv::start().await?;
    env.mount_single_aip(&mets_xml("myTransfer", "")).await;

    let first = env.coordinator().run(env.service.id).await?;
    let before = env.store.aips_by_uuid(AIP_UUID).await?;

    let second = env.coordinator().run(env.service.id).await?;
    let after = env.store.aips_by_uuid(AIP_UUID).await?;

    assert_ne!(first.fetch_job.id, second.fetch_job.id);
    assert_ne!(first.fetch_job.download_directory, second.fetch_job.download_directory);
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].mets_sha256, before[0].mets_sha256);
    assert_eq!(after[0].fetch_job_id, first.fetch_job.id);
    assert_eq!(second.workers.duplicates, 1);
    assert_eq!(second.workers.ingested, 0);
    assert_eq!(second.fetch_job.total_aips, Some(1));

    Ok(())
}

#[tokio::test]
async fn test_changed_mets_replaces_aip() -> Result<()> {
    let env = TestEnv::start().await?;
    env.mount_single_aip(&mets_xml("myTransfer", "")).await;
    env.coordinator().run(env.service.id).await?;

    let before = env.store.aips_by_uuid(AIP_UUID).await?;
    let old_files = env.store.files_for_aip(before[0].id).await?;
    let old_original = old_files.iter().find(|f| !f.is_preservation()).expect("original");
    assert_eq!(env.store.events_for_file(old_original.id).await?.len(), 2);

    env.server.reset().await;
    let extra = premis_event(
        "digiprovMD_99",
        "e0e0e0e0-1111-4222-8333-944444444444",
        "fixity check",
        "2021-03-01T12:00:00",
    );
    env.mount_single_aip(&mets_xml("myTransfer", &extra)).await;
    let second = env.coordinator().run(env.service.id).await?;

    let after = env.store.aips_by_uuid(AIP_UUID).await?;
    assert_eq!(after.len(), 1);
    assert_ne!(after[0].mets_sha256, before[0].mets_sha256);
    assert_eq!(after[0].fetch_job_id, second.fetch_job.id);

    let files = env.store.files_for_aip(after[0].id).await?;
    assert_eq!(files.len(), 2);
    let original = files.iter().find(|f| !f.is_preservation()).expect("original");
    let events = env.store.events_for_file(original.id).await?;
    let types: Vec<_> = events.iter().filter_map(|e| e.event_type.as_deref()).collect();
    assert_eq!(types, ["ingestion", "message digest calculation", "fixity check"]);

    // Nothing of the first ingestion survives.
    assert!(env.store.get_aip(before[0].id).await?.is_none());
    assert!(env.store.events_for_file(old_original.id).await?.is_empty());
    assert_eq!(env.store.orphan_counts().await?, (0, 0));

    Ok(())
}

#[tokio::test]
async fn test_deleted_package_removes_existing_aip() -> Result<()> {
    let env = TestEnv::start().await?;
    env.mount_single_aip(&mets_xml("myTransfer", "")).await;
    env.coordinator().run(env.service.id).await?;
    let agents_before = env.store.agents_for_storage_service(env.service.id).await?;
    assert_eq!(agents_before.len(), 2);

    env.server.reset().await;
    env.mount_index(vec![package_record(AIP_UUID, "AIP", "DELETED")]).await;
    let report = env.coordinator().run(env.service.id).await?;

    assert_eq!(env.aip_count(AIP_UUID).await?, 0);
    assert_eq!(env.store.orphan_counts().await?, (0, 0));
    assert_eq!(report.fetch_job.total_deleted_aips, Some(1));
    assert_eq!(report.fetch_job.total_aips, Some(0));
    assert_eq!(report.workers.ingested + report.workers.failed, 0);

    let agents_after = env.store.agents_for_storage_service(env.service.id).await?;
    assert_eq!(agents_after.len(), agents_before.len());

    Ok(())
}

#[tokio::test]
async fn test_replica_is_counted_not_fetched() -> Result<()> {
    let env = TestEnv::start().await?;
    let mut replica = aip_record(AIP_UUID);
    replica["replicated_package"] = json!("/api/v2/file/ORIG/");
    env.mount_index(vec![replica]).await;

    Mock::given(method("GET"))
        .and(path(format!("/api/v2/file/{}/extract_file/", AIP_UUID)))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&env.server)
        .await;

    let report = env.coordinator().run(env.service.id).await?;
    assert_eq!(report.fetch_job.total_replicas, Some(1));
    assert_eq!(report.fetch_job.total_aips, Some(0));
    assert_eq!(env.store.count_aips().await?, 0);

    env.server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_mixed_page_totals() -> Result<()> {
    let env = TestEnv::start().await?;
    let dip = package_record("11111111-2222-4333-8444-555555555555", "DIP", "UPLOADED");
    let transfer = package_record("22222222-3333-4444-8555-666666666666", "transfer", "UPLOADED");
    let deleted = package_record("33333333-4444-4555-8666-777777777777", "AIP", "DELETED");
    let backlog = package_record("44444444-5555-4666-8777-888888888888", "backlog", "UPLOADED");
    env.mount_index(vec![aip_record(AIP_UUID), dip, transfer, deleted, backlog]).await;
    env.mount_mets(AIP_UUID, mets_xml("myTransfer", "").into_bytes()).await;
    env.mount_location_and_pipeline().await;

    let report = env.coordinator().run(env.service.id).await?;
    let job = &report.fetch_job;
    assert_eq!(job.total_packages, Some(5));
    assert_eq!(job.total_aips, Some(1));
    assert_eq!(job.total_dips, Some(1));
    assert_eq!(job.total_sips, Some(1));
    assert_eq!(job.total_deleted_aips, Some(1));
    assert_eq!(job.total_replicas, Some(0));
    assert_eq!(env.store.count_aips().await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_follows_next_pages() -> Result<()> {
    let env = TestEnv::start_with_limit(1).await?;
    let second_uuid = "c0ffee00-27b0-4c2e-ac3e-621bab5af8f1";
    let next = format!("/api/v2/file/?limit=1&offset=1&username={}&api_key={}", USER, API_KEY);

    Mock::given(method("GET"))
        .and(path("/api/v2/file/"))
        .and(query_param("offset", "0"))
        .and(query_param("limit", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(page(2, Some(&next), vec![aip_record(AIP_UUID)])),
        )
        .mount(&env.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/file/"))
        .and(query_param("offset", "1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(page(
                2,
                None,
                vec![package_record(second_uuid, "DIP", "UPLOADED")],
            )),
        )
        .mount(&env.server)
        .await;
    env.mount_mets(AIP_UUID, mets_xml("myTransfer", "").into_bytes()).await;
    env.mount_location_and_pipeline().await;

    let report = env.coordinator().run(env.service.id).await?;
    assert_eq!(report.fetch_job.total_packages, Some(2));
    assert_eq!(report.fetch_job.total_aips, Some(1));
    assert_eq!(report.fetch_job.total_dips, Some(1));

    let packages = std::path::Path::new(&report.fetch_job.download_directory).join("packages");
    let first = std::fs::read_to_string(packages.join("packages1.json"))?;
    let second = std::fs::read_to_string(packages.join("packages2.json"))?;
    assert!(first.contains(AIP_UUID));
    assert!(second.contains(second_uuid));
    assert!(first.starts_with("{\n    \"meta\""));

    let staged: aipscan_aggregator::ingest::PackagePage = serde_json::from_str(&second)?;
    let record: &PackageRecord = &staged.objects[0];
    assert_eq!(record.package_type.as_deref(), Some("DIP"));

    Ok(())
}

#[tokio::test]
async fn test_package_lists_removed_when_configured() -> Result<()> {
    let mut env = TestEnv::start().await?;
    env.config.remove_package_lists = true;
    env.mount_single_aip(&mets_xml("myTransfer", "")).await;

    let report = env.coordinator().run(env.service.id).await?;
    let packages = std::path::Path::new(&report.fetch_job.download_directory).join("packages");
    assert!(!packages.join("packages1.json").exists());
    assert_eq!(env.aip_count(AIP_UUID).await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_index_failure_aborts_job() -> Result<()> {
    let env = TestEnv::start().await?;
    Mock::given(method("GET"))
        .and(path("/api/v2/file/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&env.server)
        .await;

    let err = env.coordinator().run(env.service.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    let message = err.to_string();
    assert!(!message.contains("username="), "{}", message);
    assert!(!message.contains("api_key="), "{}", message);
    assert!(!message.contains(API_KEY), "{}", message);

    let jobs = env.store.list_fetch_jobs(Some(env.service.id)).await?;
    assert_eq!(jobs.len(), 1);
    assert!(!jobs[0].is_complete());
    assert!(jobs[0].total_packages.is_none());

    Ok(())
}

#[tokio::test]
async fn test_failed_download_does_not_abort_job() -> Result<()> {
    let env = TestEnv::start().await?;
    env.mount_index(vec![aip_record(AIP_UUID)]).await;
    env.mount_location_and_pipeline().await;
    Mock::given(method("GET"))
        .and(path(format!("/api/v2/file/{}/extract_file/", AIP_UUID)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&env.server)
        .await;

    let report = env.coordinator().run(env.service.id).await?;
    assert!(report.fetch_job.is_complete());
    assert_eq!(report.workers.failed, 1);
    assert_eq!(report.fetch_job.total_aips, Some(1));
    assert_eq!(env.store.count_aips().await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_unparseable_mets_keeps_existing_rows() -> Result<()> {
    let env = TestEnv::start().await?;
    env.mount_single_aip(&mets_xml("myTransfer", "")).await;
    env.coordinator().run(env.service.id).await?;
    let before = env.store.aips_by_uuid(AIP_UUID).await?;

    env.server.reset().await;
    env.mount_single_aip("<mets:mets xmlns:mets=\"http://www.loc.gov/METS/\"><broken>").await;
    let report = env.coordinator().run(env.service.id).await?;

    assert_eq!(report.workers.skipped, 1);
    let after = env.store.aips_by_uuid(AIP_UUID).await?;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);

    // The unparseable download is kept for inspection.
    let kept = std::path::Path::new(&report.fetch_job.download_directory)
        .join("mets")
        .join("1")
        .join(format!("{}.xml", AIP_UUID));
    assert!(kept.is_file());

    Ok(())
}

#[tokio::test]
async fn test_missing_original_name_falls_back_to_uuid() -> Result<()> {
    let env = TestEnv::start().await?;
    let mets = mets_xml("myTransfer", "").replace(
        &format!("myTransfer-{}</premis:originalName>", AIP_UUID),
        "%transferDirectory%objects/</premis:originalName>",
    );
    env.mount_single_aip(&mets).await;

    env.coordinator().run(env.service.id).await?;
    let aips = env.store.aips_by_uuid(AIP_UUID).await?;
    assert_eq!(aips[0].transfer_name, AIP_UUID);

    Ok(())
}

#[tokio::test]
async fn test_cancelled_between_pages() -> Result<()> {
    let env = TestEnv::start_with_limit(1).await?;
    let next = format!("/api/v2/file/?limit=1&offset=1&username={}&api_key={}", USER, API_KEY);
    Mock::given(method("GET"))
        .and(path("/api/v2/file/"))
        .and(query_param("offset", "0"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(page(
                2,
                Some(&next),
                vec![package_record(AIP_UUID, "DIP", "UPLOADED")],
            )),
        )
        .mount(&env.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/file/"))
        .and(query_param("offset", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(2, None, vec![])))
        .expect(0)
        .mount(&env.server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let coordinator = env.coordinator().with_cancellation(cancel);

    let err = coordinator.run(env.service.id).await.unwrap_err();
    let job_id = match err {
        AggregatorError::Cancelled(id) => id,
        other => panic!("expected cancellation, got {}", other),
    };

    let job = env.store.get_fetch_job(job_id).await?.expect("job row");
    assert!(!job.is_complete());
    env.server.verify().await;

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_share_agents() -> Result<()> {
    let mut env = TestEnv::start().await?;
    env.config = env.config.clone().with_worker_concurrency(8);

    let uuids: Vec<String> = (0..12)
        .map(|i| format!("{:08x}-27b0-4c2e-ac3e-621bab5af8f1", 0xa1000000u32 + i))
        .collect();
    for (i, uuid) in uuids.iter().enumerate() {
        // Distinct transfer names keep every METS hash unique.
        env.mount_mets(uuid, mets_xml(&format!("transfer{:02}", i), "").into_bytes())
            .await;
    }
    env.mount_index(uuids.iter().map(|uuid| aip_record(uuid)).collect())
        .await;
    env.mount_location_and_pipeline().await;

    let report = env.coordinator().run(env.service.id).await?;
    assert_eq!(report.workers.ingested, 12, "{:?}", report.workers);
    assert_eq!(report.workers.failed, 0);
    assert_eq!(report.fetch_job.total_aips, Some(12));
    assert_eq!(env.store.count_aips().await?, 12);
    for uuid in &uuids {
        assert_eq!(env.aip_count(uuid).await?, 1, "{}", uuid);
    }

    let expected = parse_mets(mets_xml("transfer00", "").as_bytes())?.agents.len();
    let agents = env.store.agents_for_storage_service(env.service.id).await?;
    assert_eq!(agents.len(), expected);
    assert_eq!(env.store.storage_locations(env.service.id).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_page_selection_imports_window_and_reuses_session() -> Result<()> {
    let env = TestEnv::start().await?;
    let skipped = [
        "a2000001-27b0-4c2e-ac3e-621bab5af8f1",
        "a2000002-27b0-4c2e-ac3e-621bab5af8f1",
    ];
    let dip = "a2000003-27b0-4c2e-ac3e-621bab5af8f1";
    let index = vec![
        aip_record(skipped[0]),
        aip_record(skipped[1]),
        aip_record(AIP_UUID),
        package_record(dip, "DIP", "UPLOADED"),
    ];

    Mock::given(method("GET"))
        .and(path("/api/v2/file/"))
        .and(query_param("offset", "0"))
        .and(query_param("limit", "1000000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(4, None, index)))
        .expect(1)
        .mount(&env.server)
        .await;
    env.mount_mets(AIP_UUID, mets_xml("myTransfer", "").into_bytes()).await;
    env.mount_location_and_pipeline().await;

    // Page 2 of 2 covers index items 3 and 4.
    let report = env
        .coordinator()
        .run_page(env.service.id, &PageSelection::new(2, 2))
        .await?;
    let job = &report.fetch_job;
    assert!(job.is_complete());
    assert_eq!(job.total_packages, Some(4));
    assert_eq!(job.total_aips, Some(1));
    assert_eq!(job.total_dips, Some(1));
    assert_eq!(report.workers.ingested, 1);
    assert_eq!(report.workers.failed, 0);
    assert_eq!(env.aip_count(AIP_UUID).await?, 1);
    assert_eq!(env.aip_count(skipped[0]).await?, 0);
    assert_eq!(env.aip_count(skipped[1]).await?, 0);

    let staging = std::path::Path::new(&job.download_directory);
    assert!(staging.join("packages").join("packages.json").is_file());
    let session = staging
        .file_name()
        .and_then(|name| name.to_str())
        .expect("session directory")
        .to_string();

    // Page 3 starts at item 5 of 4: the job is removed and the cached index
    // is read instead of asking the service again.
    let err = env
        .coordinator()
        .run_page(env.service.id, &PageSelection::new(3, 2).with_session(session))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            AggregatorError::PageOutOfRange {
                page: 3,
                start_item: 5,
                total: 4
            }
        ),
        "{}",
        err
    );
    assert_eq!(err.kind(), ErrorKind::Config);

    let jobs = env.store.list_fetch_jobs(Some(env.service.id)).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, job.id);
    assert_eq!(env.aip_count(AIP_UUID).await?, 1);

    env.server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_storage_service() -> Result<()> {
    let env = TestEnv::start().await?;
    let err = env.coordinator().run(env.service.id + 100).await.unwrap_err();
    assert!(matches!(err, AggregatorError::NotFound(_)));
    Ok(())
}
