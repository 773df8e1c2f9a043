/*!

# Networking Interfaces and Methods

## Introduction

Peers exchange `GraphSyncMessage` frames. A frame is the bincode encoding
(varint integers, no trailing bytes) of three lists:

```bytes
requests    Vec<GraphSyncRequest>
responses   Vec<GraphSyncResponse>
blocks      Vec<Block>
```

Any of the lists may be empty. Blocks are not tied to a request; the
requestor matches them to its traversals by link.

## Requests

```bytes
id          i32, unique per requestor
root        Link (32 byte blake3 digest)
selector    encoded selector spec Node
priority    i32, higher is served first
extensions  Vec<(name, bytes)>
cancel      bool
```

A request with `cancel` set carries only its id and asks the responder to
stop serving it.

## Responses

```bytes
id          i32, the request answered
status      ResponseStatus
extensions  Vec<(name, bytes)>
```

`RequestAcknowledged` and `PartialResponse` are intermediate statuses.
`RequestCompletedFull`, `RequestCompletedPartial`, `RequestFailed` and
`RequestCancelled` end the response. The `graphsync/response-metadata`
extension lists each link the responder's traversal needed since its last
update and whether the block for it was sent.

## Framing

A frame never exceeds the configured `max_message_size`. The per-peer
`MessageQueue` packs pending requests, responses and blocks greedily into
frames under that bound and sends them one at a time.

*/
pub mod memory;
pub mod message;
pub mod message_queue;
pub mod metadata;
pub mod network;
pub mod peer;
