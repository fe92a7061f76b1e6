use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use hypergraph_lineage::{
    Artifact, BuildHandle, FilterArtifact, HashJoinBuildArtifact, HashJoinProbeArtifact,
    LineageConfig, LineageCoordinator, OperatorKind, PlanNode, ScanArtifact,
};

fn init_tracing(config: &LineageConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Single-threaded scan of 10 rows feeding a filter that keeps rows 1, 3, 5
fn scan_filter(coordinator: &LineageCoordinator) -> Result<()> {
    let plan = PlanNode::new(OperatorKind::Filter)
        .with_extra("x % 2 = 1 AND x < 6")
        .with_child(PlanNode::scan("numbers"));
    let (_, root) = coordinator.start_query("SELECT x FROM numbers WHERE x % 2 = 1 AND x < 6", &plan);

    let scan = root.children()[0].init_log(0).context("scan log not created")?;
    scan.push(Artifact::Scan(ScanArtifact { sel: None, count: 10, start: 0, vector_index: 0 }));

    let filter = root.init_log(0).context("filter log not created")?;
    filter.push(Artifact::Filter(FilterArtifact {
        sel: Some(vec![1, 3, 5]),
        count: 3,
        child_offset: 0,
    }));
    Ok(())
}

/// Two workers each scanning half of a 10-row table
fn parallel_scan(coordinator: &LineageCoordinator) -> Result<()> {
    let plan = PlanNode::scan("numbers");
    let (_, root) = coordinator.start_query("SELECT * FROM numbers", &plan);

    std::thread::scope(|scope| {
        for (thread, start) in [(0usize, 0u64), (1, 5)] {
            let root = &root;
            scope.spawn(move || {
                if let Some(writer) = root.init_log(thread) {
                    writer.push(Artifact::Scan(ScanArtifact {
                        sel: Some(vec![0, 1, 2, 3, 4]),
                        count: 5,
                        start,
                        vector_index: 0,
                    }));
                }
            });
        }
    });
    Ok(())
}

/// Hash join whose probe matches one build row twice
fn hash_join(coordinator: &LineageCoordinator) -> Result<()> {
    let plan = PlanNode::new(OperatorKind::HashJoin)
        .with_extra("l.k = r.k")
        .with_child(PlanNode::scan("l"))
        .with_child(PlanNode::scan("r"));
    let (_, root) = coordinator.start_query("SELECT * FROM l JOIN r ON l.k = r.k", &plan);

    let join = root.init_log(0).context("join log not created")?;
    join.push(Artifact::HashJoinBuild(HashJoinBuildArtifact {
        sel: None,
        scatter: vec![BuildHandle(100), BuildHandle(101), BuildHandle(102)],
        added_count: 3,
    }));
    let lsn = join
        .push(Artifact::HashJoinProbe(HashJoinProbeArtifact::new(
            Some(vec![0, 1]),
            Some(vec![BuildHandle(101), BuildHandle(101)]),
            2,
        )))
        .context("probe artifact rejected")?;
    join.push(Artifact::OutputIndex { lsn, child_offset: 0 });
    Ok(())
}

fn main() -> Result<()> {
    let mut config = LineageConfig::from_env()?;
    init_tracing(&config);
    config.capture_enabled = true;

    let coordinator = LineageCoordinator::new(config)?;
    scan_filter(&coordinator)?;
    parallel_scan(&coordinator)?;
    hash_join(&coordinator)?;

    let summaries = coordinator.queries_list()?;
    println!("{}", serde_json::to_string_pretty(&summaries)?);

    coordinator.clear();
    Ok(())
}
