use std::rc::Rc;
use tether::protocol::{status, AttachReply, UpdateFilterReply};
use tether::session::filter::{FilterType, ALL_PROCESSES_PATTERN};
use tether::session::job::JobState;
use tether::session::testing::{connected_session, TestSession};

/// Job context attached to koid `job` with the attach acknowledged.
fn attached_job(ts: &TestSession, job: u64) -> Rc<tether::session::job::JobContext> {
    let ctx = ts.session.system().create_new_job_context();
    ctx.attach(job, Box::new(|r| r.unwrap()));
    ts.drain();
    let (_, cb) = ts.mock.take_attach().remove(0);
    cb(Ok(AttachReply {
        status: status::OK,
        name: format!("job-{job}"),
    }));
    ts.drain();
    assert_eq!(ctx.state(), JobState::Attached);
    ctx
}

fn ack_filter_updates(ts: &TestSession, matched: Vec<u64>) -> Vec<Vec<String>> {
    let updates = ts.mock.take_update_filter();
    let mut sent = Vec::new();
    for (req, cb) in updates {
        sent.push(req.filters.clone());
        cb(Ok(UpdateFilterReply {
            status: status::OK,
            matched_processes: matched.clone(),
        }));
    }
    ts.drain();
    sent
}

#[test]
fn all_processes_pattern_flattens_to_empty_string() {
    let ts = connected_session();
    let job = attached_job(&ts, 1);
    ack_filter_updates(&ts, vec![]); // the attach-time sync

    let filter = ts.session.system().create_new_filter();
    filter.set_type(FilterType::ProcessName);
    filter.set_pattern(ALL_PROCESSES_PATTERN);
    ts.drain();

    let sent = ack_filter_updates(&ts, vec![]);
    assert_eq!(sent, vec![vec![String::new()]]);
    assert_eq!(job.synced_filters(), Some(vec![String::new()]));

    // any other pattern round-trips unchanged
    filter.set_pattern("netstack");
    ts.drain();
    let sent = ack_filter_updates(&ts, vec![]);
    assert_eq!(sent, vec![vec!["netstack".to_string()]]);
}

#[test]
fn filter_mutations_coalesce_into_one_update() {
    let ts = connected_session();
    attached_job(&ts, 1);
    ack_filter_updates(&ts, vec![]);

    let filter = ts.session.system().create_new_filter();
    // three mutations inside one turn
    filter.set_type(FilterType::ProcessNameSubstr);
    filter.set_pattern("net");
    filter.set_pattern("netstack");
    ts.drain();

    let sent = ack_filter_updates(&ts, vec![]);
    assert_eq!(sent.len(), 1, "one coalesced update for the whole turn");
    assert_eq!(sent[0], vec!["netstack".to_string()]);
}

#[test]
fn unchanged_filter_list_is_not_resent() {
    let ts = connected_session();
    attached_job(&ts, 1);
    ack_filter_updates(&ts, vec![]);

    let filter = ts.session.system().create_new_filter();
    filter.set_type(FilterType::ProcessNameSubstr);
    filter.set_pattern("app");
    ts.drain();
    assert_eq!(ack_filter_updates(&ts, vec![]).len(), 1);

    // an unrelated filter that flattens to nothing new
    filter.set_pattern("app");
    ts.drain();
    assert_eq!(ts.mock.take_update_filter().len(), 0, "list unchanged, no rpc");
}

#[test]
fn job_scoped_filters_only_reach_their_job() {
    let ts = connected_session();
    let job1 = attached_job(&ts, 1);
    let job2 = attached_job(&ts, 2);
    ack_filter_updates(&ts, vec![]);

    let scoped = ts.session.system().create_new_filter();
    scoped.set_type(FilterType::ProcessNameSubstr);
    scoped.set_pattern("only-job-2");
    scoped.set_job_id(Some(2));
    ts.drain();
    ack_filter_updates(&ts, vec![]);

    assert_eq!(job1.synced_filters(), Some(vec![]));
    assert_eq!(job2.synced_filters(), Some(vec!["only-job-2".to_string()]));
}

#[test]
fn matched_processes_drive_auto_attach() {
    let ts = connected_session();
    attached_job(&ts, 1);
    ack_filter_updates(&ts, vec![]);

    let filter = ts.session.system().create_new_filter();
    filter.set_type(FilterType::ProcessNameSubstr);
    filter.set_pattern("svc");
    ts.drain();
    ack_filter_updates(&ts, vec![100, 101]);

    let attaches = ts.mock.take_attach();
    let koids: Vec<u64> = attaches.iter().map(|(req, _)| req.koid).collect();
    assert_eq!(koids, vec![100, 101]);
}

#[test]
fn oversized_match_list_attaches_nothing() {
    let ts = connected_session();
    let job = ts.session.system().create_new_job_context();

    let matched: Vec<u64> = (1..=51).collect();
    ts.session.system().on_filter_matches(Some(&job), &matched);
    ts.drain();
    assert_eq!(ts.mock.attach_count(), 0, "51 matches: refuse them all");

    let matched: Vec<u64> = (1..=50).collect();
    ts.session.system().on_filter_matches(Some(&job), &matched);
    ts.drain();
    assert_eq!(ts.mock.attach_count(), 50, "50 distinct matches all attach");
}

#[test]
fn already_attached_matches_are_skipped() {
    let ts = connected_session();
    tether::session::testing::spawn_process(&ts, 100, "svc");
    let job = ts.session.system().create_new_job_context();

    ts.session
        .system()
        .on_filter_matches(Some(&job), &[100, 100, 101]);
    ts.drain();

    let attaches = ts.mock.take_attach();
    let koids: Vec<u64> = attaches.iter().map(|(req, _)| req.koid).collect();
    assert_eq!(koids, vec![101], "attached and duplicate koids skipped");
}
