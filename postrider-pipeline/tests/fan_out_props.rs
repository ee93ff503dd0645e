//! Property tests for the per-recipient fan-out.

use postrider_common::message::{MailOptions, ReceivedMessage, Recipient};
use proptest::prelude::*;

fn address_strategy() -> impl Strategy<Value = String> {
    ("[a-z]{1,8}", "[a-z]{2,8}\\.[a-z]{2,4}").prop_map(|(local, domain)| format!("{local}@{domain}"))
}

proptest! {
    #[test]
    fn fan_out_emits_one_identical_job_per_recipient(
        from in address_strategy(),
        recipients in proptest::collection::vec(address_strategy(), 1..5),
        body in proptest::collection::vec(any::<u8>(), 0..512),
        envelope_id in proptest::option::of("[a-z0-9-]{1,16}"),
    ) {
        let message = ReceivedMessage {
            from: from.clone(),
            recipients: recipients.iter().map(|addr| Recipient::new(addr.clone())).collect(),
            body: body.clone(),
            mail_options: Some(MailOptions { envelope_id, size: None, require_tls: false }),
        };

        let jobs = message.queued_messages();

        prop_assert_eq!(jobs.len(), recipients.len());
        for (job, recipient) in jobs.iter().zip(&recipients) {
            prop_assert_eq!(&job.to, recipient);
            prop_assert_eq!(&job.from, &from);
            prop_assert_eq!(&job.body, &body);
            prop_assert_eq!(job.error_count, 0);
            prop_assert!(job.last_error.is_none());
        }
    }
}
