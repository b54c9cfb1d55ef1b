use anyhow::Result;
use async_trait::async_trait;
use vigil_channel_telegram::ChatCommandHandler;
use vigil_core::{
    AgentClient, DialogStep, DialogTable, FetchError, MonitorService, RegistryError,
    RegistryStore, ServerStatus,
};

/// Binds the chat surface to the registry service and the per-user dialog
/// table, and turns typed core errors into reply text. Only store failures
/// propagate as errors; everything else is an answer to the user.
pub struct ControllerHandler<S, A>
where
    S: RegistryStore,
    A: AgentClient,
{
    service: MonitorService<S, A>,
    dialogs: DialogTable,
    agent_port: u16,
}

impl<S, A> ControllerHandler<S, A>
where
    S: RegistryStore,
    A: AgentClient,
{
    pub fn new(service: MonitorService<S, A>, agent_port: u16) -> Self {
        Self {
            service,
            dialogs: DialogTable::new(),
            agent_port,
        }
    }

    /// Any action other than confirming abandons a pending delete; the reply
    /// notes it so the user is not left believing a delete is still armed.
    fn abandon_note(&self, user_id: &str) -> String {
        match self.dialogs.abandon_delete(user_id) {
            Some(name) => format!("Delete of '{name}' abandoned.\n\n"),
            None => String::new(),
        }
    }

    fn prompt_name_text() -> String {
        "What should the new server be called? One word, e.g. de1.\nSend /cancel to stop."
            .to_string()
    }

    fn prompt_address_text(name: &str) -> String {
        format!("Now send the IPv4 address of '{name}', e.g. 192.168.1.100.")
    }

    fn confirm_delete_text(name: &str, address: Option<&str>) -> String {
        let shown = match address {
            Some(address) => format!("'{name}' ({address})"),
            None => format!("'{name}'"),
        };
        format!("Delete {shown}? Send yes to confirm; anything else keeps it.")
    }

    fn added_text(&self, name: &str, address: &str, secret: &str) -> String {
        format!(
            "Server '{name}' ({address}) registered and made active.\n\n\
             Its secret key is shown this one time:\n{secret}\n\n\
             Install the agent with it; /install shows the steps."
        )
    }

    async fn commit_add(&self, user_id: &str, name: &str, address: &str) -> Result<String> {
        match self.service.add_server(user_id, name, address).await {
            Ok(secret) => Ok(self.added_text(name, address, &secret)),
            Err(RegistryError::DuplicateName(name)) => Ok(format!(
                "A server named '{name}' was registered in the meantime; the existing one \
                 was left untouched. Start over with /add and a different name."
            )),
            Err(RegistryError::Store(err)) => Err(err),
            Err(other) => Ok(other.to_string()),
        }
    }

    async fn commit_delete(&self, user_id: &str, name: &str) -> Result<String> {
        match self.service.delete_server(user_id, name).await {
            Ok(()) => Ok(format!("Server '{name}' deleted.")),
            Err(RegistryError::NotFound(name)) => {
                Ok(format!("No server named '{name}' is registered anymore."))
            }
            Err(RegistryError::Store(err)) => Err(err),
            Err(other) => Ok(other.to_string()),
        }
    }
}

fn render_status(status: &ServerStatus) -> String {
    let snapshot = &status.snapshot;
    format!(
        "Status of '{}' ({})\nCPU: {}%\nMemory: {} / {} GB ({}%)\nDisk: {} / {} GB ({}%)",
        status.server,
        status.address,
        snapshot.cpu,
        snapshot.memory.used,
        snapshot.memory.total,
        snapshot.memory.percent,
        snapshot.disk.used,
        snapshot.disk.total,
        snapshot.disk.percent,
    )
}

fn render_fetch_error(err: &FetchError) -> String {
    match err {
        FetchError::NoActiveServer => {
            "No active server is configured. /add registers one, /use picks one.".to_string()
        }
        FetchError::Unreachable { server } => format!(
            "Could not reach server '{server}'. Check that the machine is up and the agent \
             is running, then try /status again."
        ),
        FetchError::AuthRejected { server } => format!(
            "Server '{server}' rejected the secret key. The agent is running with a \
             different key; /install shows the current one."
        ),
        FetchError::AgentMisconfigured { server } => format!(
            "The agent on '{server}' has no secret key configured. Restart it with the \
             SECRET_KEY from /install."
        ),
        FetchError::MalformedResponse { server } => format!(
            "Server '{server}' answered, but not with a status report. Make sure the vigil \
             agent is what listens on the agent port."
        ),
        FetchError::Store(_) => "Registry is unavailable right now.".to_string(),
    }
}

#[async_trait]
impl<S, A> ChatCommandHandler for ControllerHandler<S, A>
where
    S: RegistryStore,
    A: AgentClient,
{
    async fn show_menu(&self, user_id: &str) -> Result<String> {
        let note = self.abandon_note(user_id);
        let servers = self.service.list_servers(user_id).await?;
        let body = if servers.is_empty() {
            "No servers registered yet. Send /add to set up the first one.".to_string()
        } else {
            let active = servers
                .iter()
                .find(|server| server.active)
                .map(|server| server.name.as_str())
                .unwrap_or("none");
            format!(
                "{} server(s) registered, active: {}.\n/status shows its metrics; /help lists \
                 all commands.",
                servers.len(),
                active
            )
        };
        Ok(format!("{note}{body}"))
    }

    async fn fetch_status(&self, user_id: &str) -> Result<String> {
        let note = self.abandon_note(user_id);
        let body = match self.service.fetch_status(user_id).await {
            Ok(status) => render_status(&status),
            Err(FetchError::Store(err)) => return Err(err),
            Err(err) => render_fetch_error(&err),
        };
        Ok(format!("{note}{body}"))
    }

    async fn list_servers(&self, user_id: &str) -> Result<String> {
        let note = self.abandon_note(user_id);
        let servers = self.service.list_servers(user_id).await?;
        if servers.is_empty() {
            return Ok(format!(
                "{note}No servers registered. Send /add to set one up."
            ));
        }

        let mut lines = vec!["Your servers:".to_string()];
        for server in servers {
            let marker = if server.active { " (active)" } else { "" };
            lines.push(format!("- {} {}{}", server.name, server.address, marker));
        }
        Ok(format!("{note}{}", lines.join("\n")))
    }

    async fn activate_server(&self, user_id: &str, name: &str) -> Result<String> {
        let note = self.abandon_note(user_id);
        let body = match self.service.set_active(user_id, name).await {
            Ok(()) => format!("'{name}' is now the active server."),
            Err(RegistryError::Store(err)) => return Err(err),
            Err(other) => other.to_string(),
        };
        Ok(format!("{note}{body}"))
    }

    async fn rename_server(
        &self,
        user_id: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<String> {
        let note = self.abandon_note(user_id);
        let body = match self.service.rename_server(user_id, old_name, new_name).await {
            Ok(()) => format!("'{old_name}' is now called '{new_name}'."),
            Err(RegistryError::Store(err)) => return Err(err),
            Err(other) => other.to_string(),
        };
        Ok(format!("{note}{body}"))
    }

    async fn install_instructions(&self, user_id: &str) -> Result<String> {
        let note = self.abandon_note(user_id);
        let Some(server) = self.service.get_active(user_id).await? else {
            return Ok(format!(
                "{note}No active server. /add registers one, /use picks one."
            ));
        };
        Ok(format!(
            "{note}Agent install for '{}' ({}):\n\n\
             1. Copy the vigil-agent binary onto the machine.\n\
             2. Start it with this server's secret key:\n\
             SECRET_KEY=\"{}\" vigil-agent --listen 0.0.0.0:{}\n\n\
             The controller will query http://{}:{}/status with that key.",
            server.name, server.address, server.secret, self.agent_port, server.address,
            self.agent_port,
        ))
    }

    async fn begin_add_server(&self, user_id: &str) -> Result<String> {
        // Restarts any dialog already in progress, pending deletes included.
        self.dialogs.begin_add(user_id);
        Ok(Self::prompt_name_text())
    }

    async fn begin_delete_server(&self, user_id: &str, name: &str) -> Result<String> {
        let Some(server) = self.service.get_server(user_id, name).await? else {
            return Ok(format!("No server named '{name}' is registered."));
        };
        self.dialogs.begin_delete(user_id, name);
        Ok(Self::confirm_delete_text(
            &server.name,
            Some(&server.address),
        ))
    }

    async fn dialog_input(&self, user_id: &str, text: &str) -> Result<Option<String>> {
        let Some(step) = self.dialogs.offer_text(user_id, text) else {
            return Ok(None);
        };

        let reply = match step {
            DialogStep::PromptName => Self::prompt_name_text(),
            DialogStep::NameRejected { reason } => {
                format!("{reason}. Try another name, or /cancel.")
            }
            DialogStep::PromptAddress { name } => Self::prompt_address_text(&name),
            DialogStep::AddressRejected { address } => format!(
                "'{address}' is not a valid IPv4 address. Try again, or /cancel."
            ),
            DialogStep::ReadyToCommit { name, address } => {
                self.commit_add(user_id, &name, &address).await?
            }
            DialogStep::ConfirmDelete { name } => Self::confirm_delete_text(&name, None),
            DialogStep::DeleteConfirmed { name } => self.commit_delete(user_id, &name).await?,
            DialogStep::DeleteAbandoned { name } => format!("Keeping '{name}'."),
        };
        Ok(Some(reply))
    }

    async fn cancel_dialog(&self, user_id: &str) -> Result<String> {
        if self.dialogs.cancel(user_id) {
            Ok("Cancelled. Nothing was changed.".to_string())
        } else {
            Ok("Nothing to cancel.".to_string())
        }
    }
}
