mod cancellation;
mod coalescing;
mod delivery;
mod failures;
mod http;
