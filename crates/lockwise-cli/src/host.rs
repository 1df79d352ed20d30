//! Terminal host shell: prints host notifications to stdout.

use lockwise_kernel::{CancelReason, Credential};
use lockwise_session::{CredentialList, HostShell};

pub struct TerminalHost;

impl HostShell for TerminalHost {
    fn display_welcome(&self) {
        println!("  [welcome] Unlock to continue: `unlock [key]`");
    }

    fn display_item_list(&self, list: &CredentialList) {
        match list.filter() {
            Some(service) => println!("  [list] {} login(s) for {service}", list.len()),
            None => println!("  [list] {} login(s)", list.len()),
        }
        for credential in list.iter() {
            println!(
                "    {}  {}  {}",
                credential.id,
                credential.origin,
                credential.username.as_deref().unwrap_or("-")
            );
        }
    }

    fn complete_extension_configuration_request(&self) {
        println!("  [ready] Extension configured.");
    }

    fn complete_request(&self, credential: &Credential) {
        println!(
            "  [filled] {} as {}",
            credential.origin,
            credential.username.as_deref().unwrap_or("-")
        );
    }

    fn cancel_request(&self, reason: CancelReason) {
        println!("  [cancelled] {reason:?}");
    }
}
