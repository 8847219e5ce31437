use tokio::sync::watch;

/// Raises an `Interrupt`. Held by whoever decides a run must stop, e.g. a signal handler.
pub struct InterruptTrigger(watch::Sender<bool>);

impl InterruptTrigger {
    pub fn raise(&self) {
        self.0.send_replace(true);
    }
}

/// Checked by the run loop at each of its blocking points.
#[derive(Clone)]
pub struct Interrupt(watch::Receiver<bool>);

impl Interrupt {
    /// An interrupt that can never be raised.
    pub fn never() -> Self {
        let (_, receiver) = watch::channel(false);
        Interrupt(receiver)
    }

    pub fn is_raised(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the interrupt is raised. Pends forever if the trigger is gone.
    pub async fn raised(&mut self) {
        if self.0.wait_for(|raised| *raised).await.is_err() {
            std::future::pending::<()>().await
        }
    }
}

pub fn channel() -> (InterruptTrigger, Interrupt) {
    let (sender, receiver) = watch::channel(false);
    (InterruptTrigger(sender), Interrupt(receiver))
}
