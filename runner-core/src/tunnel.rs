use async_trait::async_trait;

/// The HTTP/WebSocket tunneling machinery is an external collaborator
/// (spec §1, §4.6): the core only needs to bring it up before the control
/// socket opens and tell it when an actor goes away. Everything else
/// (accepting inbound traffic, multiplexing it to `fetch`/`websocket`
/// handlers) lives on the other side of this trait.
#[async_trait]
pub trait Tunnel: Send + Sync {
	/// Opens the tunnel and waits for it to become ready. First-attempt
	/// failure is fatal to `Runner::start()`; the tunnel is responsible
	/// for recovering from any disconnection after that.
	async fn start(&self) -> anyhow::Result<()>;

	/// Called whenever the registry removes an actor (explicit stop,
	/// start failure, or bulk teardown). Forcibly closes every WebSocket
	/// the tunnel was tracking for this actor with normal closure (1000)
	/// and releases its request state.
	async fn unregister_actor(&self, actor_id: &str, generation: u32);
}

/// A tunnel that is always immediately ready and has nothing to release.
/// Useful for hosts that don't route inbound traffic through this runner
/// and for tests that only exercise the control-channel protocol.
pub struct NoopTunnel;

#[async_trait]
impl Tunnel for NoopTunnel {
	async fn start(&self) -> anyhow::Result<()> {
		Ok(())
	}

	async fn unregister_actor(&self, _actor_id: &str, _generation: u32) {}
}
