use pdm_core::{Pass, ProjectDependent, ProjectRecord};
use pdm_merge::{list_potential_duplicates, run_merge, MergeConfig, MergePipeline};
use pdm_store::{AttachmentRow, DependentRow, MemoryProjectStore, ProjectStore, StoreSnapshot};

fn charleston(id: i64, name: &str, stage: &str) -> ProjectRecord {
    ProjectRecord::new(id, name)
        .with_location("Charleston", "SC")
        .with_stage(stage)
}

fn seeded_store() -> MemoryProjectStore {
    MemoryProjectStore::new(StoreSnapshot {
        projects: vec![
            charleston(1, "1450 Meeting St", "Identified").with_deal(101),
            charleston(2, "1450 Meeting St.", "Rejected").with_deal(102),
            ProjectRecord::new(3, "Waters")
                .with_location("Baton Rouge", "LA")
                .with_deal(103),
            ProjectRecord::new(4, "The Waters at Millerville")
                .with_location("Baton Rouge", "LA")
                .with_stage("Closed")
                .with_deal(104),
            ProjectRecord::new(5, "Magnolia Park Commons").with_location("Mobile", "AL"),
            ProjectRecord::new(6, "Magnolia Park Phase II")
                .with_location("Mobile", "AL")
                .with_stage("Identified"),
            ProjectRecord::new(7, "Oak Grove Estates").with_location("Savannah", "GA"),
            ProjectRecord::new(8, "Oak Grove Villas").with_location("Savannah", "SC"),
        ],
        attachments: vec![
            AttachmentRow { attachment_id: 1, deal_id: 102 },
            AttachmentRow { attachment_id: 2, deal_id: 103 },
        ],
        dependents: vec![
            DependentRow { kind: ProjectDependent::UnderContract, project_id: 2 },
            DependentRow { kind: ProjectDependent::CommercialListed, project_id: 3 },
            DependentRow { kind: ProjectDependent::CommercialListed, project_id: 4 },
        ],
    })
}

#[tokio::test]
async fn three_passes_merge_into_keepers() {
    let store = seeded_store();
    let summary = MergePipeline::new(&store, false).run().await.expect("run");

    assert_eq!(summary.merged, 3);
    let exact = &summary.passes[0];
    assert_eq!(exact.pass, Pass::Exact);
    assert_eq!(exact.groups.len(), 1);
    assert_eq!(exact.groups[0].keeper_id, 1);
    assert_eq!(exact.groups[0].removed[0].id, 2);

    let normalized = &summary.passes[1];
    assert_eq!(normalized.groups.len(), 1);
    assert_eq!(normalized.groups[0].keeper_id, 4);
    assert!(normalized.candidates < exact.candidates);

    let city_state = &summary.passes[2];
    assert_eq!(city_state.groups.len(), 1);
    assert_eq!(city_state.groups[0].keeper_id, 6);

    let after = store.snapshot().await;
    let ids: Vec<i64> = after.projects.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![1, 4, 6, 7, 8]);

    // attachments follow the keeper's deal
    assert!(after
        .attachments
        .iter()
        .any(|a| a.attachment_id == 1 && a.deal_id == 101));
    assert!(after
        .attachments
        .iter()
        .any(|a| a.attachment_id == 2 && a.deal_id == 104));

    // dependents are repointed, or dropped when the keeper already has one
    assert!(after
        .dependents
        .contains(&DependentRow { kind: ProjectDependent::UnderContract, project_id: 1 }));
    assert_eq!(
        after
            .dependents
            .iter()
            .filter(|d| d.kind == ProjectDependent::CommercialListed)
            .count(),
        1
    );
}

#[tokio::test]
async fn keeper_ids_never_deleted() {
    let store = seeded_store();
    let summary = MergePipeline::new(&store, false).run().await.expect("run");
    let remaining = store.fetch_projects().await.unwrap();
    for pass in &summary.passes {
        for group in &pass.groups {
            assert!(group.removed.iter().all(|r| r.id != group.keeper_id));
            assert!(remaining.iter().any(|p| p.id == group.keeper_id));
        }
    }
}

#[tokio::test]
async fn dry_run_changes_nothing_but_reports_the_same_groups() {
    let store = seeded_store();
    let before = store.snapshot().await;
    let summary = MergePipeline::new(&store, true).run().await.expect("dry run");

    assert!(summary.dry_run);
    assert_eq!(summary.merged, 3);
    assert!(summary
        .passes
        .iter()
        .flat_map(|p| &p.groups)
        .all(|g| !g.applied && g.outcomes.is_empty()));
    assert_eq!(store.snapshot().await, before);

    // pass 2 must not see ids that pass 1 would have removed
    assert_eq!(summary.passes[1].candidates, before.projects.len() - 1);
}

#[tokio::test]
async fn different_states_never_group_in_pass_three() {
    let store = MemoryProjectStore::from_projects(vec![
        ProjectRecord::new(1, "Oak Grove Estates").with_location("Savannah", "GA"),
        ProjectRecord::new(2, "Oak Grove Villas").with_location("Savannah", "SC"),
    ]);
    let summary = MergePipeline::new(&store, false).run().await.expect("run");
    assert_eq!(summary.merged, 0);
    assert!(summary.passes.iter().all(|p| p.groups.is_empty()));
    assert_eq!(store.fetch_projects().await.unwrap().len(), 2);
}

#[tokio::test]
async fn failing_merge_aborts_the_run() {
    // keeper has no deal, so the duplicate's attachment blocks deleting its deal
    let store = MemoryProjectStore::new(StoreSnapshot {
        projects: vec![
            charleston(1, "Harbor Point", "Identified"),
            charleston(2, "Harbor Point", "Rejected").with_deal(20),
        ],
        attachments: vec![AttachmentRow { attachment_id: 9, deal_id: 20 }],
        dependents: vec![],
    });
    let before = store.snapshot().await;
    let err = MergePipeline::new(&store, false).run().await.unwrap_err();
    assert!(format!("{err:#}").contains("foreign key violation"));
    assert_eq!(store.snapshot().await, before);
}

#[tokio::test]
async fn run_merge_writes_reports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let reports = dir.path().to_string_lossy().to_string();
    let config = MergeConfig::from_lookup(move |key| match key {
        "PDM_REPORTS_DIR" => Some(reports.clone()),
        "MERGE_DRY_RUN" => Some("1".to_string()),
        _ => None,
    })
    .expect("config");

    let store = seeded_store();
    let summary = run_merge(&store, &config).await.expect("run");
    let run_dir = dir.path().join(summary.run_id.to_string());
    assert!(run_dir.join("merge_run.json").exists());
    let markdown = std::fs::read_to_string(run_dir.join("merge_summary.md")).unwrap();
    assert!(markdown.contains("## Pass 1 (exact duplicate name): 1 group(s)"));
    assert!(config.database().is_err());
}

#[tokio::test]
async fn listing_reads_without_mutating() {
    let store = seeded_store();
    let before = store.snapshot().await;
    let listing = list_potential_duplicates(&store).await.expect("listing");
    assert_eq!(listing.exact_groups.len(), 1);
    assert!(!listing.likely_pairs.is_empty());
    assert_eq!(store.snapshot().await, before);
}
