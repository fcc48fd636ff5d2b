use pwhg_runner::{
    check::{check_slot, report::CheckReport, summary::CampaignSummary, SUMMARY_FILE},
    cluster::Cluster,
    collector::{slot_dir, Collector},
    executors::{record::RecordingGateway, BatchConfig, Executors, JobCommand},
    resubmit::{resubmit_failed, Action, CampaignParams, ReweightRequest},
    simulation::{slot_record_path, Process, Reweight, SimConfig},
    submit::Pipeline,
};
use std::{fs, path::Path};
use tempfile::TempDir;

fn event_file(weights: &[&str], events: usize, closed: bool) -> String {
    let mut content = String::from("<LesHouchesEvents version=\"3.0\">\n<header>\n<initrwgt>\n");
    content.push_str("<weightgroup name='scale uncertainties' combine='foo'>\n");
    for id in weights {
        content.push_str(&format!("<weight id='{id}'> variation {id} </weight>\n"));
    }
    content.push_str("</weightgroup>\n</initrwgt>\n</header>\n");
    for _ in 0..events {
        content.push_str("<event>\n 5 10001 1.0 0.1 -1 0.118\n</event>\n");
    }
    if closed {
        content.push_str("</LesHouchesEvents>\n");
    }
    content
}

fn write_slot(workdir: &Path, slot: u32, content: &str) {
    let dir = slot_dir(workdir, slot);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("pwgevents.lhe"), content).unwrap();
}

#[test]
fn check_summary_resubmit_loop() {
    let dir = TempDir::with_prefix("pwhg").unwrap();
    let workdir = dir.path();

    SimConfig::new(workdir, Process::Dijet)
        .with_version("r3964")
        .with_input("/in/powheg.input")
        .with_events(1000)
        .store_for_stage()
        .unwrap();

    let all = ["main", "1", "2", "3", "4", "5", "6", "7"];
    write_slot(workdir, 0, &event_file(&all, 10, true));
    // slot 1 never produced anything
    fs::create_dir_all(slot_dir(workdir, 1)).unwrap();
    write_slot(workdir, 2, &event_file(&["main", "1", "2", "4", "5", "6", "7"], 10, true));
    write_slot(workdir, 3, &event_file(&all, 4, false));

    for slot in Collector::slots(workdir).unwrap() {
        check_slot(&slot).unwrap();
    }
    let summary = CampaignSummary::from_workdir(workdir, Some(0..5)).unwrap();
    summary.store(workdir).unwrap();

    assert_eq!(summary.total(), 5);
    assert_eq!(summary.existing(), 3);
    assert_eq!(summary.complete(), 2);
    assert_eq!(summary.events(), 24);

    let report = CheckReport::load(&workdir.join(SUMMARY_FILE)).unwrap();
    assert_eq!(report.non_existing.len(), 2);
    assert_eq!(report.incomplete.len(), 1);
    assert_eq!(report.missing_weights.len(), 1);
    assert_eq!(report.missing_weights[0].missing_scale_weights(), vec![3]);

    let mut executor = Executors::Record(RecordingGateway::new());
    let mut pipeline = Pipeline::new(
        &mut executor,
        "/opt/pwhg-runner",
        vec!["--cluster".to_owned(), "B587".to_owned()],
        BatchConfig::new(Cluster::B587).with_partition("long"),
    );
    let params = CampaignParams {
        partition: "long".to_owned(),
        reweight: ReweightRequest::Scale,
        ..Default::default()
    };
    let outcome = resubmit_failed(workdir, &params, &mut pipeline).unwrap();

    let actions: Vec<_> = outcome.planned.iter().map(|slot| (slot.slot, slot.action)).collect();
    assert_eq!(
        actions,
        vec![
            (1, Action::Full),
            (2, Action::Targeted),
            (3, Action::Full),
            (4, Action::Full)
        ]
    );
    assert!(outcome.skipped.is_empty());
    assert_eq!(outcome.check_jobs.len(), 4);
    assert!(outcome.final_check.is_some());
    assert!(outcome.next_iteration.is_some());

    // full resubmissions start from a clean slot, targeted ones keep the events
    assert!(!slot_dir(workdir, 3).exists());
    assert!(slot_dir(workdir, 2).join("pwgevents.lhe").exists());
    assert_eq!(
        SimConfig::load(&slot_record_path(workdir, 2)).unwrap().reweight,
        Reweight::Scale { min_id: 0 }
    );

    let Executors::Record(gateway) = &executor else {
        panic!("expected the recording gateway");
    };
    // 4 compute, 4 check, final check, next iteration
    assert_eq!(gateway.submitted().len(), 10);

    let final_check = gateway.find(outcome.final_check.unwrap()).unwrap();
    assert_eq!(final_check.batch.dependency.len(), 4);

    let next = gateway.find(outcome.next_iteration.unwrap()).unwrap();
    assert_eq!(next.batch.dependency, vec![outcome.final_check.unwrap()]);
    assert!(matches!(next.command, JobCommand::Script(_)));

    let wrapper = fs::read_to_string(workdir.join("stage").join("resubmit_wrapper.sh")).unwrap();
    assert!(wrapper.contains("--scalereweight --iteration 2"));
    assert!(wrapper.contains("-p long"));
}

#[test]
fn campaign_from_slot_10_reports_only_its_slots() {
    let dir = TempDir::with_prefix("pwhg").unwrap();
    let workdir = dir.path();
    let config = SimConfig::new(workdir, Process::Dijet)
        .with_input("/in/powheg.input")
        .with_min_slot(10);

    let mut executor = Executors::Record(RecordingGateway::new());
    let mut pipeline = Pipeline::new(
        &mut executor,
        "/opt/pwhg-runner",
        vec![],
        BatchConfig::new(Cluster::B587),
    );
    pipeline.submit_campaign(&config, 5, None).unwrap();

    let all = ["main", "1", "2", "3", "4", "5", "6", "7"];
    for slot in 10..14 {
        write_slot(workdir, slot, &event_file(&all, 10, true));
    }
    for slot in Collector::slots(workdir).unwrap() {
        check_slot(&slot).unwrap();
    }

    let summary = CampaignSummary::from_workdir(workdir, Some(10..15)).unwrap();
    summary.store(workdir).unwrap();
    assert_eq!(summary.total(), 5);
    assert_eq!(summary.complete(), 4);

    let report = CheckReport::load(&workdir.join(SUMMARY_FILE)).unwrap();
    assert_eq!(report.non_existing, vec![slot_dir(workdir, 14).join("pwgevents.lhe")]);

    let outcome = resubmit_failed(workdir, &CampaignParams::default(), &mut pipeline).unwrap();
    let slots: Vec<_> = outcome.planned.iter().map(|slot| slot.slot).collect();
    assert_eq!(slots, vec![14]);
    assert_eq!(outcome.planned[0].action, Action::Full);
}
